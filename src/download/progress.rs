// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Line classifiers for downloader output.
//!
//! Everything that depends on the exact wording of yt-dlp's console output
//! is kept in this file, so a change in the tool's messages is a change here
//! and nowhere else.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// `[download]  45.2% of 10.5MiB at 1.2MiB/s ETA 00:05`
static PROGRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[download\]\s+(\d+(?:\.\d+)?)%").expect("valid progress regex")
});

/// Lines announcing where the tool writes (or has written) the result.
static DESTINATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"^\[Merger\] Merging formats into "(.+)"$"#,
        r"^\[ExtractAudio\] Destination: (.+)$",
        r"^\[download\] Destination: (.+)$",
        r"^\[download\] (.+) has already been downloaded",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid destination regex"))
    .collect()
});

/// Extract the percentage from a progress announcement.
///
/// Returns `None` for anything that is not one, including garbled or
/// truncated lines.
pub fn extract_progress(line: &str) -> Option<f64> {
    let caps = PROGRESS_PATTERN.captures(line)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    value.is_finite().then_some(value)
}

/// True if the line reports a transient error the tool is about to retry,
/// e.g. `[download] Got error: HTTP Error 403. Retrying (1/10)...`.
pub fn is_retry_notice(line: &str) -> bool {
    line.contains("Got error") && line.contains("Retrying")
}

/// Extract the output path announced on this line, if any.
pub fn destination_from_line(line: &str) -> Option<String> {
    let line = line.trim_end();
    DESTINATION_PATTERNS.iter().find_map(|re| {
        re.captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|path| !path.is_empty())
    })
}

/// File name component of an announced destination.
pub fn destination_file_name(destination: &str) -> Option<String> {
    Path::new(destination)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}
