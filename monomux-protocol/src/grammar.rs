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

//! Tiny helpers for pulling tagged substrings out of the bracketed
//! payload grammar. There is no generic parser here on purpose --
//! every message kind has a fixed, known shape, so a handful of
//! `strip_prefix`/`find` calls are clearer than a grammar engine.

use std::fmt;

#[derive(Debug)]
pub struct GrammarError;

impl fmt::Display for GrammarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("malformed control message payload")
    }
}

impl std::error::Error for GrammarError {}

/// Finds the first `open ... close` span in `s` and returns
/// `(contents, remainder_after_close)`.
pub(crate) fn extract<'a>(s: &'a str, open: &str, close: &str) -> Option<(&'a str, &'a str)> {
    let rest = s.strip_prefix(open)?;
    let end = rest.find(close)?;
    Some((&rest[..end], &rest[end + close.len()..]))
}

/// Repeatedly extracts consecutive `open ... close` spans from the
/// start of `s`, stopping at the first position that doesn't begin
/// with `open`. Used for the repeated-element lists (`<ARG>`,
/// `<ENV>`, `<VAR>`, ...).
pub(crate) fn extract_all<'a>(mut s: &'a str, open: &str, close: &str) -> Vec<&'a str> {
    let mut out = Vec::new();
    while let Some((contents, rest)) = extract(s, open, close) {
        out.push(contents);
        s = rest;
    }
    out
}
