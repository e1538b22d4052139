//! Identifiers and value types shared by jobs, storage and backends.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SrmError;

/// Process-wide unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl JobId {
    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(JobId)
    }
}

/// Operation type of a job. Selects the scheduler that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Get,
    Put,
    Copy,
    BringOnline,
    Ls,
    ReserveSpace,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::Get,
        JobType::Put,
        JobType::Copy,
        JobType::BringOnline,
        JobType::Ls,
        JobType::ReserveSpace,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Get => "get",
            JobType::Put => "put",
            JobType::Copy => "copy",
            JobType::BringOnline => "bring_online",
            JobType::Ls => "ls",
            JobType::ReserveSpace => "reserve_space",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "get" => Ok(JobType::Get),
            "put" => Ok(JobType::Put),
            "copy" => Ok(JobType::Copy),
            "bring_online" | "bringonline" => Ok(JobType::BringOnline),
            "ls" => Ok(JobType::Ls),
            "reserve_space" | "reservespace" => Ok(JobType::ReserveSpace),
            _ => Err(format!("unknown job type '{}'", s)),
        }
    }
}

/// Opaque reference to a delegated credential. Never inspected here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRef(pub i64);

/// Identity a request is executed as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrmUser {
    pub name: String,
    pub credential: Option<CredentialRef>,
}

impl SrmUser {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: CredentialRef) -> Self {
        self.credential = Some(credential);
        self
    }
}

impl fmt::Display for SrmUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A storage URL of the form `srm://host[:port]/path` or
/// `srm://host[:port]/endpoint?SFN=/path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Surl(String);

const SURL_SCHEME: &str = "srm://";

impl Surl {
    pub fn parse(value: &str) -> Result<Self, SrmError> {
        let value = value.trim();
        let rest = value
            .strip_prefix(SURL_SCHEME)
            .ok_or_else(|| SrmError::InvalidSurl(format!("'{}' is not an srm:// URL", value)))?;
        let slash = rest
            .find('/')
            .ok_or_else(|| SrmError::InvalidSurl(format!("'{}' has no path", value)))?;
        if slash == 0 {
            return Err(SrmError::InvalidSurl(format!("'{}' has no host", value)));
        }
        let surl = Surl(value.to_string());
        if surl.path().is_empty() || !surl.path().starts_with('/') {
            return Err(SrmError::InvalidSurl(format!("'{}' has no path", value)));
        }
        Ok(surl)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host part, without the port.
    pub fn host(&self) -> &str {
        let rest = &self.0[SURL_SCHEME.len()..];
        let authority = rest.split('/').next().unwrap_or_default();
        authority.split(':').next().unwrap_or_default()
    }

    /// File path on the storage element.
    pub fn path(&self) -> &str {
        if let Some((_, sfn)) = self.0.split_once("?SFN=") {
            return sfn;
        }
        let rest = &self.0[SURL_SCHEME.len()..];
        match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => "",
        }
    }
}

impl fmt::Display for Surl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Surl {
    type Err = SrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Surl::parse(s)
    }
}

impl TryFrom<String> for Surl {
    type Error = SrmError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Surl::parse(&value)
    }
}

impl From<Surl> for String {
    fn from(surl: Surl) -> Self {
        surl.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surl_parse() {
        let surl = Surl::parse("srm://se.example.org:8443/data/file1").unwrap();
        assert_eq!(surl.host(), "se.example.org");
        assert_eq!(surl.path(), "/data/file1");

        let sfn = Surl::parse("srm://se.example.org:8443/srm/managerv2?SFN=/pnfs/a/b").unwrap();
        assert_eq!(sfn.path(), "/pnfs/a/b");
    }

    #[test]
    fn test_surl_rejects_malformed() {
        assert!(Surl::parse("gsiftp://host/path").is_err());
        assert!(Surl::parse("srm://host").is_err());
        assert!(Surl::parse("srm:///path").is_err());
        assert!(Surl::parse("srm://host/ep?SFN=relative").is_err());
    }

    #[test]
    fn test_job_type_parse() {
        assert_eq!("bring-online".parse::<JobType>().unwrap(), JobType::BringOnline);
        assert_eq!("LS".parse::<JobType>().unwrap(), JobType::Ls);
        assert!("move".parse::<JobType>().is_err());
        for t in JobType::ALL {
            assert_eq!(t.as_str().parse::<JobType>().unwrap(), t);
        }
    }
}
