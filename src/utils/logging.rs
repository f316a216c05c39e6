//! Plain-text export of the conversation, appended as messages are sealed.

use crate::core::message::{Message, MessageStatus, TranscriptRole};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;

pub struct LoggingState {
    file_path: Option<String>,
    is_active: bool,
}

impl LoggingState {
    /// A state logging to `log_file` right away, or disabled when `None`.
    pub fn new(log_file: Option<String>) -> Result<Self, Box<dyn std::error::Error>> {
        let mut logging = LoggingState {
            file_path: None,
            is_active: false,
        };
        if let Some(path) = log_file {
            logging.set_log_file(path)?;
        }
        Ok(logging)
    }

    pub fn set_log_file(&mut self, path: String) -> Result<String, Box<dyn std::error::Error>> {
        Self::test_file_access(&path)?;

        self.file_path = Some(path.clone());
        self.is_active = true;
        tracing::debug!(path = %path, "transcript logging enabled");

        Ok(format!("Logging enabled to: {path}"))
    }

    pub fn toggle_logging(&mut self) -> Result<String, Box<dyn std::error::Error>> {
        match &self.file_path {
            Some(path) => {
                if self.is_active {
                    self.write_to_log("## Logging paused")?;
                    self.is_active = false;
                    Ok(format!("Logging paused (file: {path})"))
                } else {
                    self.is_active = true;
                    Ok(format!("Logging resumed to: {path}"))
                }
            }
            None => {
                Err("No log file specified. Use /log <filename> to enable logging first.".into())
            }
        }
    }

    /// Append a sealed message. Streaming placeholders and empty replies are skipped.
    pub fn log_message(&self, message: &Message) -> Result<(), Box<dyn std::error::Error>> {
        if !self.is_active || message.status == MessageStatus::Streaming {
            return Ok(());
        }
        let entry = match message.role {
            TranscriptRole::User => format!("You ({}): {}", message.display_time(), message.content),
            TranscriptRole::Assistant if message.content.is_empty() => return Ok(()),
            TranscriptRole::Assistant => message.content.clone(),
        };
        self.write_to_log(&entry)
    }

    fn write_to_log(&self, content: &str) -> Result<(), Box<dyn std::error::Error>> {
        let Some(file_path) = self.file_path.as_ref() else {
            return Ok(());
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        let mut writer = BufWriter::new(file);

        for line in content.lines() {
            writeln!(writer, "{line}")?;
        }
        // Blank line between messages.
        writeln!(writer)?;

        writer.flush()?;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn get_status_string(&self) -> String {
        let file_name = |path: &str| {
            Path::new(path)
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string()
        };
        match (&self.file_path, self.is_active) {
            (None, _) => "disabled".to_string(),
            (Some(path), true) => format!("active ({})", file_name(path)),
            (Some(path), false) => format!("paused ({})", file_name(path)),
        }
    }

    fn test_file_access(path: &str) -> Result<(), Box<dyn std::error::Error>> {
        OpenOptions::new().create(true).append(true).open(path)?;
        Ok(())
    }
}
