// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

/// Validity in years for issuer certs when `--validity` isn't given.
pub const DEFAULT_ISSUER_YEARS: u32 = 2;

/// Validity in years for intermediate CAs when `--validity` isn't given.
pub const DEFAULT_INTERMEDIATE_YEARS: u32 = 5;

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read CA descriptor \"{}\": {e}", path.display())]
    ReadDescriptor { path: PathBuf, e: std::io::Error },

    #[error("failed to parse CA descriptor from YAML: {e}")]
    BadDescriptor { e: serde_yaml::Error },
}

/// Convert a count of years to a fixed duration. A year is taken to be
/// 365.25 days: the quarter day works out to 6 hours per year and is added
/// once, no matter how many years are requested.
pub fn years(n: u32) -> Duration {
    Duration::from_secs(6 * HOUR + u64::from(n) * 365 * DAY)
}

/// The distinguished name fields this tool puts in the certificates it
/// creates.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Subject {
    pub country: String,
    pub organization: String,
    pub organizational_unit: String,
    pub common_name: String,
}

impl Subject {
    /// Copy of this subject with only the common name replaced.
    pub fn with_common_name(&self, cn: &str) -> Self {
        Self {
            common_name: cn.to_string(),
            ..self.clone()
        }
    }
}

/// YAML document describing a new root CA:
///
/// ```yaml
/// cn: Acme Root
/// country: US
/// organization: Acme
/// organization-unit: Eng
/// validity: 5
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CaDescriptor {
    pub cn: String,
    pub country: String,
    pub organization: String,
    pub organization_unit: String,
    /// years
    pub validity: u32,
}

impl CaDescriptor {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = fs::read_to_string(path).map_err(|e| {
            ConfigError::ReadDescriptor {
                path: path.to_path_buf(),
                e,
            }
        })?;

        yaml.parse()
    }

    pub fn subject(&self) -> Subject {
        Subject {
            country: self.country.clone(),
            organization: self.organization.clone(),
            organizational_unit: self.organization_unit.clone(),
            common_name: self.cn.clone(),
        }
    }

    pub fn validity(&self) -> Duration {
        years(self.validity)
    }
}

impl FromStr for CaDescriptor {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(data).map_err(|e| ConfigError::BadDescriptor { e })
    }
}

/// Where the contents of a new CA database come from. Exactly one source
/// is chosen and it's chosen before anything is read from disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InitSource {
    /// JSON previously produced by the `export` command.
    ImportJson(PathBuf),
    /// YAML `CaDescriptor` for a brand new root CA.
    Descriptor(PathBuf),
}

impl InitSource {
    /// Pick the source from the `init` options. The JSON export wins when
    /// both are given. `None` when there's nothing to initialize from.
    pub fn choose(
        from_json: Option<&Path>,
        yaml_config: Option<&Path>,
    ) -> Option<Self> {
        let nonempty = |p: &&Path| !p.as_os_str().is_empty();

        if let Some(json) = from_json.filter(nonempty) {
            Some(InitSource::ImportJson(json.to_path_buf()))
        } else {
            yaml_config
                .filter(nonempty)
                .map(|yaml| InitSource::Descriptor(yaml.to_path_buf()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    const YAML_ACME: &str = r#"
cn: Acme Root
country: US
organization: Acme
organization-unit: Eng
validity: 5
"#;

    #[test]
    fn test_years_formula() {
        for n in [0u32, 1, 2, 5, 10, 30, 100, u32::MAX] {
            let expected = u64::from(n) * 365 * 24 * 60 * 60 + 6 * 60 * 60;
            assert_eq!(years(n), Duration::from_secs(expected), "n = {}", n);
        }
    }

    #[test]
    fn test_years_zero_is_six_hours() {
        assert_eq!(years(0), Duration::from_secs(6 * 60 * 60));
    }

    #[test]
    fn test_descriptor_deserialize() -> Result<()> {
        let desc = CaDescriptor::from_str(YAML_ACME)?;
        assert_eq!(desc.cn, "Acme Root");
        assert_eq!(desc.country, "US");
        assert_eq!(desc.organization, "Acme");
        assert_eq!(desc.organization_unit, "Eng");
        assert_eq!(desc.validity, 5);
        assert_eq!(desc.validity(), years(5));

        let subject = desc.subject();
        assert_eq!(
            subject,
            Subject {
                country: "US".to_string(),
                organization: "Acme".to_string(),
                organizational_unit: "Eng".to_string(),
                common_name: "Acme Root".to_string(),
            }
        );
        Ok(())
    }

    #[test]
    fn test_descriptor_missing_field() {
        let yaml = "cn: Acme Root\ncountry: US\nvalidity: 5\n";
        assert!(matches!(
            CaDescriptor::from_str(yaml),
            Err(ConfigError::BadDescriptor { .. })
        ));
    }

    #[test]
    fn test_descriptor_negative_validity() {
        let yaml = YAML_ACME.replace("validity: 5", "validity: -1");
        assert!(CaDescriptor::from_str(&yaml).is_err());
    }

    #[test]
    fn test_descriptor_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("ca.yml");
        assert!(matches!(
            CaDescriptor::from_file(&missing),
            Err(ConfigError::ReadDescriptor { .. })
        ));
    }

    #[test]
    fn test_subject_with_common_name() {
        let subject = CaDescriptor::from_str(YAML_ACME).unwrap().subject();
        let issuer = subject.with_common_name("Acme Issuer");
        assert_eq!(issuer.common_name, "Acme Issuer");
        assert_eq!(issuer.country, subject.country);
        assert_eq!(issuer.organization, subject.organization);
        assert_eq!(issuer.organizational_unit, subject.organizational_unit);
    }

    #[test]
    fn test_init_source_prefers_json() {
        let json = Path::new("ca.json");
        let yaml = Path::new("ca.yml");
        assert_eq!(
            InitSource::choose(Some(json), Some(yaml)),
            Some(InitSource::ImportJson(json.to_path_buf()))
        );
        assert_eq!(
            InitSource::choose(None, Some(yaml)),
            Some(InitSource::Descriptor(yaml.to_path_buf()))
        );
    }

    #[test]
    fn test_init_source_none() {
        assert_eq!(InitSource::choose(None, None), None);
        // empty strings from the command line count as absent
        assert_eq!(InitSource::choose(Some(Path::new("")), None), None);
        assert_eq!(
            InitSource::choose(Some(Path::new("")), Some(Path::new("c.yml"))),
            Some(InitSource::Descriptor(PathBuf::from("c.yml")))
        );
    }
}
