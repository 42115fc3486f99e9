use std::path::Path;

use pimsync_core::journal::read_journal;
use pimsync_core::recorder::format_notifications;
use pimsync_core::Notification;
use serde::Serialize;

use crate::commands::common::{existing_journal, render_bytes};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct NotificationItem {
    pub index: usize,
    pub kind: String,
    pub operation: String,
    pub ids: Vec<i64>,
    pub session: String,
    pub resource: String,
    pub parent: i64,
    pub destination: i64,
    pub destination_resource: String,
    pub metadata: Vec<String>,
}

pub fn notification_to_item(index: usize, ntf: &Notification) -> NotificationItem {
    NotificationItem {
        index,
        kind: ntf.kind().to_string(),
        operation: ntf.operation().to_string(),
        ids: ntf.entity_ids(),
        session: render_bytes(&ntf.session_id),
        resource: ntf.resource.clone(),
        parent: ntf.parent_collection,
        destination: ntf.parent_dest_collection,
        destination_resource: ntf.destination_resource.clone(),
        metadata: ntf.metadata.iter().map(|marker| render_bytes(marker)).collect(),
    }
}

pub fn render_dump(settings: &Path, as_json: bool) -> Result<String, CliError> {
    let notifications = read_journal(&existing_journal(settings)?)?;

    if as_json {
        let items = notifications
            .iter()
            .enumerate()
            .map(|(index, ntf)| notification_to_item(index, ntf))
            .collect::<Vec<_>>();
        Ok(serde_json::to_string_pretty(&items)?)
    } else if notifications.is_empty() {
        Ok("No pending notifications.".to_string())
    } else {
        Ok(format_notifications(&notifications).trim_end().to_string())
    }
}

pub fn run_dump(settings: &Path, as_json: bool) -> Result<(), CliError> {
    println!("{}", render_dump(settings, as_json)?);
    Ok(())
}
