//! Job variables exported into every command session.
//!
//! Stage definitions refer to the job being built through plain shell variables:
//! - `$PR_SHA1` - Commit being built
//! - `$PR_NUMBER` - Change (pull request) number
//! - `$PR_ID` - Provider-wide unique change id
//! - `$PR_NAME` - Short project name
//! - `$PR_FULL_NAME` - Full project name (owner/name)
//! - `$PR_CLONE_URL` - Where the change can be fetched from
//! - `$PR_BRANCH` - Branch of the change

use boardci_core::JobDescriptor;

/// Name/value pairs derived from a job descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobVariables {
    vars: Vec<(&'static str, String)>,
}

impl JobVariables {
    pub fn from_descriptor(descriptor: &JobDescriptor) -> Self {
        Self {
            vars: vec![
                ("PR_SHA1", descriptor.commit_ref.clone()),
                ("PR_NUMBER", descriptor.change_number.to_string()),
                ("PR_ID", descriptor.unique_id.to_string()),
                ("PR_NAME", descriptor.project_name.clone()),
                ("PR_FULL_NAME", descriptor.project_full_name.clone()),
                ("PR_CLONE_URL", descriptor.clone_url.clone()),
                ("PR_BRANCH", descriptor.branch.clone()),
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.vars.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// One `export NAME='value'` line per variable.
    pub fn export_lines(&self) -> Vec<String> {
        self.vars
            .iter()
            .map(|(k, v)| format!("export {}={}", k, shell_quote(v)))
            .collect()
    }
}

/// Quote `value` for a POSIX shell so it is taken literally.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
