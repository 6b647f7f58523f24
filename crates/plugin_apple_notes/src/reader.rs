//! Reading notes out of Notes.app.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppleNote {
    pub id: String,
    pub name: String,
    /// HTML body as returned by Notes.
    pub body: String,
    pub folder: String,
    pub creation_date: String,
    pub modification_date: String,
}

impl AppleNote {
    pub fn plain_text(&self) -> String {
        strip_html(&self.body)
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        parse_date(&self.modification_date)
    }
}

#[async_trait]
pub trait NoteReader: Send + Sync {
    /// Notes modified within the last `since`.
    async fn read_notes(&self, since: Duration) -> Result<Vec<AppleNote>>;
}

/// Queries Notes.app through `osascript`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsaScriptReader;

#[async_trait]
impl NoteReader for OsaScriptReader {
    async fn read_notes(&self, since: Duration) -> Result<Vec<AppleNote>> {
        let script = notes_script(since.as_secs());
        let output = Command::new("osascript")
            .arg("-e")
            .arg(&script)
            .output()
            .await
            .context("failed to execute osascript")?;
        if !output.status.success() {
            bail!("osascript error: {}", String::from_utf8_lossy(&output.stderr).trim());
        }
        let notes: Vec<AppleNote> = serde_json::from_slice(&output.stdout).with_context(|| {
            format!("failed to parse notes (output: {})", String::from_utf8_lossy(&output.stdout))
        })?;
        debug!(count = notes.len(), "notes read from Notes.app");
        Ok(notes)
    }
}

fn notes_script(seconds_ago: u64) -> String {
    format!(
        r#"
tell application "Notes"
	set cutoffDate to (current date) - {seconds_ago}
	set noteList to ""
	try
		set recentNotes to every note whose modification date > cutoffDate
	on error
		set recentNotes to {{}}
		repeat with n in notes
			try
				if modification date of n > cutoffDate then
					set end of recentNotes to n
				end if
			end try
		end repeat
	end try
	repeat with n in recentNotes
		try
			set noteFolder to "Notes"
			try
				set noteFolder to name of container of n
			end try
			set noteJSON to "{{\"id\":\"" & (id of n) & "\",\"name\":\"" & my esc(name of n) & "\",\"body\":\"" & my esc(body of n) & "\",\"folder\":\"" & my esc(noteFolder) & "\",\"creation_date\":\"" & ((creation date of n) as «class isot» as string) & "\",\"modification_date\":\"" & ((modification date of n) as «class isot» as string) & "\"}}"
			if noteList is "" then
				set noteList to noteJSON
			else
				set noteList to noteList & "," & noteJSON
			end if
		end try
	end repeat
	return "[" & noteList & "]"
end tell

on esc(theText)
	set theText to my swap(theText, "\\", "\\\\")
	set theText to my swap(theText, "\"", "\\\"")
	set theText to my swap(theText, return, "\\n")
	set theText to my swap(theText, linefeed, "\\n")
	set theText to my swap(theText, tab, "\\t")
	return theText
end esc

on swap(theText, needle, replacement)
	set AppleScript's text item delimiters to needle
	set parts to every text item of theText
	set AppleScript's text item delimiters to replacement
	set theText to parts as string
	set AppleScript's text item delimiters to ""
	return theText
end swap
"#
    )
}

/// Drops tags, decodes the common entities and removes blank lines.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// AppleScript `«class isot»` dates carry no offset and are local time.
fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").ok()?;
    Local.from_local_datetime(&naive).earliest().map(|dt| dt.with_timezone(&Utc))
}
