use std::path::Path;

use pimsync_core::journal::{inspect_journal, JournalInfo};

use crate::commands::common::existing_journal;
use crate::error::CliError;

pub fn format_info_lines(info: &JournalInfo) -> Vec<String> {
    let mut lines = vec![
        format!("Journal:         {}", info.path.display()),
        format!("Size:            {} bytes", info.size_bytes),
        format!("Format version:  {}", info.version),
        format!("Declared count:  {}", info.declared_count),
        format!("Start offset:    {}", info.start_offset),
        format!("Pending:         {}", info.pending),
        format!("Discarded:       {}", info.discarded),
    ];
    if let Some(reason) = &info.truncated {
        lines.push(format!("Truncated:       {reason}"));
    }
    lines.push(format!(
        "Needs rewrite:   {}",
        if info.needs_full_save { "yes" } else { "no" }
    ));
    lines
}

pub fn render_info(settings: &Path, as_json: bool) -> Result<String, CliError> {
    let info = inspect_journal(&existing_journal(settings)?)?;
    if as_json {
        Ok(serde_json::to_string_pretty(&info)?)
    } else {
        Ok(format_info_lines(&info).join("\n"))
    }
}

pub fn run_info(settings: &Path, as_json: bool) -> Result<(), CliError> {
    println!("{}", render_info(settings, as_json)?);
    Ok(())
}
