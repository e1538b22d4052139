//! Per-type payloads carried by a job.
//!
//! Container requests and file requests share the [`Job`](super::Job) state
//! machine; what differs is the payload below, which holds the request
//! parameters and the results filled in by processing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::{JobId, JobType, Surl};
use crate::backend::FileMetaData;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Container aggregating file requests of one type.
    Request(RequestSpec),
    GetFile(GetFileRequest),
    PutFile(PutFileRequest),
    CopyFile(CopyFileRequest),
    BringOnlineFile(BringOnlineFileRequest),
    LsFile(LsFileRequest),
    ReserveSpace(ReserveSpaceRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub request_type: JobType,
    pub children: Vec<JobId>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetFileRequest {
    pub surl: Surl,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub turl: Option<String>,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub pin_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutFileRequest {
    pub surl: Surl,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub turl: Option<String>,
    #[serde(default)]
    pub file_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyFileRequest {
    pub source: Surl,
    pub destination: Surl,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BringOnlineFileRequest {
    pub surl: Surl,
    #[serde(default)]
    pub pin_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LsFileRequest {
    pub surl: Surl,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub entries: Vec<FileMetaData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveSpaceRequest {
    pub size: u64,
    #[serde(with = "duration_secs")]
    pub space_lifetime: Duration,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub space_token: Option<String>,
}

impl GetFileRequest {
    pub fn new(surl: Surl, protocols: Vec<String>) -> Self {
        Self {
            surl,
            protocols,
            turl: None,
            file_id: None,
            pin_id: None,
        }
    }
}

impl PutFileRequest {
    pub fn new(surl: Surl, size: Option<u64>, overwrite: bool, protocols: Vec<String>) -> Self {
        Self {
            surl,
            size,
            overwrite,
            protocols,
            turl: None,
            file_id: None,
        }
    }
}

impl JobKind {
    /// Runtime type used to route the job to its scheduler.
    pub fn job_type(&self) -> JobType {
        match self {
            JobKind::Request(spec) => spec.request_type,
            JobKind::GetFile(_) => JobType::Get,
            JobKind::PutFile(_) => JobType::Put,
            JobKind::CopyFile(_) => JobType::Copy,
            JobKind::BringOnlineFile(_) => JobType::BringOnline,
            JobKind::LsFile(_) => JobType::Ls,
            JobKind::ReserveSpace(_) => JobType::ReserveSpace,
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, JobKind::Request(_))
    }

    /// Children of a container, empty for file requests.
    pub fn children(&self) -> &[JobId] {
        match self {
            JobKind::Request(spec) => &spec.children,
            _ => &[],
        }
    }

    /// Whether the job is owned by a scheduler. Copy containers fan their
    /// children out from a worker; the other containers are never scheduled
    /// and wait for their children in `AsyncWait` from the start.
    pub fn is_scheduled(&self) -> bool {
        match self {
            JobKind::Request(spec) => spec.request_type == JobType::Copy,
            _ => true,
        }
    }

    /// One-line description used in listings and by pattern cancellation.
    pub fn summary(&self) -> String {
        match self {
            JobKind::Request(spec) => format!(
                "{} request with {} file(s){}",
                spec.request_type,
                spec.children.len(),
                spec.description
                    .as_deref()
                    .map(|d| format!(" [{}]", d))
                    .unwrap_or_default()
            ),
            JobKind::GetFile(get) => format!("get {}", get.surl),
            JobKind::PutFile(put) => format!("put {}", put.surl),
            JobKind::CopyFile(copy) => format!("copy {} {}", copy.source, copy.destination),
            JobKind::BringOnlineFile(bol) => format!("bring_online {}", bol.surl),
            JobKind::LsFile(ls) => format!("ls {}", ls.surl),
            JobKind::ReserveSpace(reserve) => format!(
                "reserve_space {} bytes{}",
                reserve.size,
                reserve
                    .description
                    .as_deref()
                    .map(|d| format!(" [{}]", d))
                    .unwrap_or_default()
            ),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surl(path: &str) -> Surl {
        Surl::parse(&format!("srm://se.example.org{}", path)).unwrap()
    }

    #[test]
    fn test_job_type_routing() {
        let get = JobKind::GetFile(GetFileRequest::new(surl("/a"), vec![]));
        assert_eq!(get.job_type(), JobType::Get);
        assert!(get.is_scheduled());

        let container = JobKind::Request(RequestSpec {
            request_type: JobType::Put,
            children: vec![JobId(2), JobId(3)],
            description: None,
        });
        assert_eq!(container.job_type(), JobType::Put);
        assert!(!container.is_scheduled());
        assert_eq!(container.children(), &[JobId(2), JobId(3)]);

        let copy = JobKind::Request(RequestSpec {
            request_type: JobType::Copy,
            children: vec![],
            description: None,
        });
        assert!(copy.is_scheduled());
    }

    #[test]
    fn test_payload_json_shape() {
        let kind = JobKind::PutFile(PutFileRequest::new(surl("/b"), Some(10), false, vec![]));
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["kind"], "put_file");
        assert_eq!(json["surl"], "srm://se.example.org/b");

        let back: JobKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, kind);
    }

    #[test]
    fn test_summary_contains_surl() {
        let kind = JobKind::LsFile(LsFileRequest {
            surl: surl("/dir"),
            depth: 1,
            entries: vec![],
        });
        assert_eq!(kind.summary(), "ls srm://se.example.org/dir");
    }
}
