//! Session state shared by the commands.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::logging::ActivityLog;
use crate::mail::GmailClient;
use crate::roster::Roster;
use crate::userlist;

pub struct AppContext {
    pub config: Config,
    pub log: Arc<ActivityLog>,
    mail: Option<GmailClient>,
}

impl AppContext {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            log: Arc::new(ActivityLog::new()),
            mail: None,
        }
    }

    /// Load and normalize a user list into an editable roster.
    pub fn load_roster(&self, path: &Path) -> Result<Roster> {
        let ulist = userlist::load(path, self.config.certificate.normalize_options())
            .with_context(|| format!("could not load user list {}", path.display()))?;
        Ok(Roster::from_ulist(&ulist))
    }

    /// The Gmail client, authorizing on first use.
    pub fn mail_client(&mut self) -> Result<&mut GmailClient> {
        if self.mail.is_none() {
            self.mail = Some(self.connect_mail()?);
        }
        self.mail.as_mut().context("mail client unavailable")
    }

    /// Hand the Gmail client to a background batch.
    pub fn take_mail_client(&mut self) -> Result<GmailClient> {
        match self.mail.take() {
            Some(client) => Ok(client),
            None => self.connect_mail(),
        }
    }

    fn connect_mail(&self) -> Result<GmailClient> {
        let emailing = &self.config.emailing;
        GmailClient::connect(&emailing.client_secret, &emailing.token_file)
            .context("Gmail authorization failed")
    }

    /// True when the output directory holds at least one certificate.
    pub fn certificates_exist(&self) -> bool {
        fs::read_dir(&self.config.files.output_dir)
            .map(|entries| {
                entries.flatten().any(|entry| {
                    entry
                        .path()
                        .extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("png"))
                })
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> AppContext {
        let mut config = Config::with_path(dir.path().join("config.toml"));
        config.files.output_dir = dir.path().join("certificates");
        AppContext::new(config)
    }

    #[test]
    fn certificates_exist_needs_a_png() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        assert!(!ctx.certificates_exist());

        fs::create_dir_all(&ctx.config.files.output_dir).unwrap();
        assert!(!ctx.certificates_exist());

        fs::write(ctx.config.files.output_dir.join("A.png"), b"png").unwrap();
        assert!(ctx.certificates_exist());
    }

    #[test]
    fn load_roster_puts_flagged_rows_last() {
        let dir = TempDir::new().unwrap();
        let list = dir.path().join("users.txt");
        fs::write(&list, "Zed z@x.com\nAmy a1@x.com\nAmy a2@x.com\n").unwrap();

        let roster = context(&dir).load_roster(&list).unwrap();
        let names: Vec<&str> = roster.rows().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["ZED", "AMY", "AMY"]);
        assert_eq!(roster.valid_entries().len(), 1);
    }

    #[test]
    fn unsupported_table_is_an_error() {
        let dir = TempDir::new().unwrap();
        let list = dir.path().join("users.csv");
        fs::write(&list, "First,Last\nA,B\n").unwrap();
        assert!(context(&dir).load_roster(&list).is_err());
        assert!(context(&dir)
            .load_roster(&PathBuf::from("/nonexistent/users.csv"))
            .unwrap()
            .is_empty());
    }
}
