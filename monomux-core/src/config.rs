// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml")?;
        config = toml::from_str(&config_str).context("parsing config file")?;
    } else if let Some(home) = std::env::var_os("HOME") {
        let mut config_path = PathBuf::from(home);
        config_path.push(".config");
        config_path.push("monomux");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(&config_path).context("reading config toml")?;
            config = toml::from_str(&config_str).context("parsing config file")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// The program to spawn for a new session when `--` doesn't
    /// override it. Falls back to `$SHELL`, then `/bin/sh`.
    pub default_shell: Option<String>,

    /// Environment variables to unset in every spawned session's
    /// process, regardless of what the invoking client's environment
    /// carried. Useful for variables that only make sense in the
    /// client's shell (e.g. a different terminal's `TERM`).
    #[serde(default)]
    pub unset_env: Vec<String>,

    /// If true, the daemon exits once the last live session's process
    /// exits, instead of idling with zero sessions until killed.
    #[serde(default)]
    pub exit_on_last_session_terminate: bool,
}
