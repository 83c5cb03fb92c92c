// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use log::{debug, warn};
use std::env;
use thiserror::Error;
use zeroize::Zeroizing;

const PASSWD_PROMPT: &str = "Enter password for DB: ";
const PASSWD_PROMPT2: &str = "Enter password again to confirm: ";

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("environment variable \"{name}\" is not valid unicode")]
    EnvNotUnicode { name: String },

    #[error("failed to read password: {e}")]
    Read { e: std::io::Error },

    #[error("the passwords entered do not match")]
    Mismatch,
}

pub trait PasswordReader {
    fn read(
        &mut self,
        prompt: &str,
    ) -> Result<Zeroizing<String>, CredentialError>;
}

/// Masked password entry on the controlling terminal.
#[derive(Default)]
pub struct StdioPasswordReader {}

impl PasswordReader for StdioPasswordReader {
    fn read(
        &mut self,
        prompt: &str,
    ) -> Result<Zeroizing<String>, CredentialError> {
        rpassword::prompt_password(prompt)
            .map(Zeroizing::new)
            .map_err(|e| CredentialError::Read { e })
    }
}

/// Where the database password comes from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PasswordSource {
    /// Name of an environment variable holding the password. Its value is
    /// used as is: no confirmation and no masking.
    Env(String),
    Prompt,
}

impl PasswordSource {
    /// Build from the `--env-password` option, an empty name means prompt.
    pub fn new(env_password: Option<&str>) -> Self {
        match env_password {
            Some(name) if !name.is_empty() => Self::Env(name.to_string()),
            _ => Self::Prompt,
        }
    }
}

/// Whether the password is for a database that's about to be created.
/// New passwords are entered twice.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Confirm {
    NewDatabase,
    ExistingDatabase,
}

/// Get the database password from the environment or the user. A failure
/// to read or a mismatched confirmation is returned, never retried.
pub fn get_password(
    source: &PasswordSource,
    reader: &mut dyn PasswordReader,
    confirm: Confirm,
) -> Result<Zeroizing<String>, CredentialError> {
    let name = match source {
        PasswordSource::Env(name) => name,
        PasswordSource::Prompt => return prompt(reader, confirm),
    };

    debug!("getting password from environment variable: {}", name);
    match env::var(name) {
        Ok(password) => Ok(Zeroizing::new(password)),
        Err(env::VarError::NotPresent) => {
            warn!("{} is not set, using an empty password", name);
            Ok(Zeroizing::new(String::new()))
        }
        Err(env::VarError::NotUnicode(_)) => {
            Err(CredentialError::EnvNotUnicode { name: name.clone() })
        }
    }
}

fn prompt(
    reader: &mut dyn PasswordReader,
    confirm: Confirm,
) -> Result<Zeroizing<String>, CredentialError> {
    let password = reader.read(PASSWD_PROMPT)?;
    if confirm == Confirm::NewDatabase {
        let password2 = reader.read(PASSWD_PROMPT2)?;
        if password != password2 {
            return Err(CredentialError::Mismatch);
        }
        debug!("got the same password twice");
    }

    Ok(password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    /// Hands out canned answers and records the prompts it was shown.
    struct ScriptedReader {
        answers: Vec<&'static str>,
        prompts: Vec<String>,
    }

    impl ScriptedReader {
        fn new(answers: &[&'static str]) -> Self {
            Self {
                answers: answers.iter().rev().copied().collect(),
                prompts: Vec::new(),
            }
        }
    }

    impl PasswordReader for ScriptedReader {
        fn read(
            &mut self,
            prompt: &str,
        ) -> Result<Zeroizing<String>, CredentialError> {
            self.prompts.push(prompt.to_string());
            self.answers
                .pop()
                .map(|a| Zeroizing::new(a.to_string()))
                .ok_or(CredentialError::Read {
                    e: std::io::ErrorKind::UnexpectedEof.into(),
                })
        }
    }

    #[test]
    fn test_source_from_option() {
        assert_eq!(PasswordSource::new(None), PasswordSource::Prompt);
        assert_eq!(PasswordSource::new(Some("")), PasswordSource::Prompt);
        assert_eq!(
            PasswordSource::new(Some("CA_PW")),
            PasswordSource::Env("CA_PW".to_string())
        );
    }

    #[test]
    fn test_env_password_never_prompts() -> Result<()> {
        env::set_var("CA_PW", "secret");
        let source = PasswordSource::new(Some("CA_PW"));

        for confirm in [Confirm::NewDatabase, Confirm::ExistingDatabase] {
            let mut reader = ScriptedReader::new(&[]);
            let password = get_password(&source, &mut reader, confirm)?;
            assert_eq!(password.as_str(), "secret");
            assert!(reader.prompts.is_empty());
        }
        Ok(())
    }

    #[test]
    fn test_env_password_unset_is_empty() -> Result<()> {
        env::remove_var("PKI_TOOL_TEST_UNSET_PW");
        let source = PasswordSource::Env("PKI_TOOL_TEST_UNSET_PW".to_string());
        let mut reader = ScriptedReader::new(&["ignored"]);
        let password =
            get_password(&source, &mut reader, Confirm::ExistingDatabase)?;
        assert_eq!(password.as_str(), "");
        assert!(reader.prompts.is_empty());
        Ok(())
    }

    #[test]
    fn test_prompt_once_for_existing() -> Result<()> {
        let mut reader = ScriptedReader::new(&["hunter2"]);
        let password = get_password(
            &PasswordSource::Prompt,
            &mut reader,
            Confirm::ExistingDatabase,
        )?;
        assert_eq!(password.as_str(), "hunter2");
        assert_eq!(reader.prompts, vec![PASSWD_PROMPT.to_string()]);
        Ok(())
    }

    #[test]
    fn test_prompt_twice_for_new() -> Result<()> {
        let mut reader = ScriptedReader::new(&["hunter2", "hunter2"]);
        let password = get_password(
            &PasswordSource::Prompt,
            &mut reader,
            Confirm::NewDatabase,
        )?;
        assert_eq!(password.as_str(), "hunter2");
        assert_eq!(reader.prompts.len(), 2);
        Ok(())
    }

    #[test]
    fn test_prompt_mismatch_is_fatal() {
        let mut reader = ScriptedReader::new(&["hunter2", "hunter3", "x"]);
        assert!(matches!(
            get_password(
                &PasswordSource::Prompt,
                &mut reader,
                Confirm::NewDatabase
            ),
            Err(CredentialError::Mismatch)
        ));
        // no second round of prompts
        assert_eq!(reader.prompts.len(), 2);
    }

    #[test]
    fn test_read_failure_is_fatal() {
        let mut reader = ScriptedReader::new(&[]);
        assert!(matches!(
            get_password(
                &PasswordSource::Prompt,
                &mut reader,
                Confirm::ExistingDatabase
            ),
            Err(CredentialError::Read { .. })
        ));
    }
}
