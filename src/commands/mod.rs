pub mod cleanup;
pub mod config;
pub mod exec;
pub mod force;
pub mod record;
pub mod run;
pub mod status;
pub mod supervise;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }
}

#[cfg(test)]
mod tests {
    use super::CommandReport;

    #[test]
    fn issue_flips_ok() {
        let mut report = CommandReport::new("force");
        report.detail("task=writeback-daily");
        assert!(report.ok);
        report.issue("unknown task: nope");
        assert!(!report.ok);
        assert_eq!(report.issues, vec!["unknown task: nope".to_string()]);
    }
}
