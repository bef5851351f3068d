//! Wire vocabulary and framing for the replication control plane.
//!
//! Every message on the wire is a `[u32 little-endian length][body]`
//! frame. A request opens with a header frame identifying which typed
//! body (if any) follows; every response is a single frame carrying a
//! status code plus type-specific extension fields.

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::core::error::{Error, Result};

/// Upper bound on a single frame body.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Replica request sub-types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRequestKind {
    Create,
    Delete,
    Find,
    FindAll,
}

/// Request-management sub-types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagementKind {
    Status,
    Stop,
}

/// Service-management sub-types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceKind {
    Suspend,
    Resume,
    Status,
}

/// The common header opening every request exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestHeader {
    /// A replica request follows; the body is the matching `*Body`.
    Replica(ReplicaRequestKind),
    /// A management request follows; the body is a `ManagementBody`.
    Management {
        kind: ManagementKind,
        target: ReplicaRequestKind,
    },
    /// Service requests are fully expressed by the header.
    Service(ServiceKind),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateBody {
    pub priority: i32,
    pub id: String,
    pub database: String,
    pub chunk: u32,
    pub source_worker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteBody {
    pub priority: i32,
    pub id: String,
    pub database: String,
    pub chunk: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindBody {
    pub priority: i32,
    pub id: String,
    pub database: String,
    pub chunk: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindAllBody {
    pub priority: i32,
    pub id: String,
    pub database: String,
}

/// Body of a status probe or stop order, quoting the target request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementBody {
    pub id: String,
}

/// Remote status of a request as reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    Bad,
    Failed,
    Queued,
    InProgress,
    IsCancelling,
    Cancelled,
}

/// Replica health as seen by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    NotFound,
    Corrupt,
    Incomplete,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub status: ReplicaStatus,
    pub worker: String,
    pub database: String,
    pub chunk: u32,
}

/// Response to replica submissions and to status/stop probes. The
/// payload fields are filled once the underlying operation succeeded:
/// `replica` for FIND targets, `replicas` for FIND_ALL targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResponse {
    pub status: Status,
    pub replica: Option<ReplicaInfo>,
    pub replicas: Option<Vec<ReplicaInfo>>,
}

impl RequestResponse {
    pub fn of(status: Status) -> Self {
        RequestResponse {
            status,
            replica: None,
            replicas: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Running,
    SuspendInProgress,
    Suspended,
}

/// Response to service management requests: the service state machine
/// plus the processor queue counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub status: Status,
    pub service_state: ServiceState,
    pub num_new: u64,
    pub num_in_progress: u64,
    pub num_finished: u64,
}

/// Write one length-framed message.
pub async fn write_frame<T, S>(stream: &mut S, msg: &T) -> Result<()>
where
    T: Serialize,
    S: AsyncWriteExt + Unpin,
{
    let body = bincode::serialize(msg)?;
    if body.len() as u64 > MAX_FRAME_SIZE as u64 {
        return Err(Error::protocol("frame too large"));
    }
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(&body);
    stream.write_all(&buf).await?;
    Ok(())
}

/// Read one length-framed message. EOF before the length prefix comes
/// back as an Io error so connection loops can distinguish a clean close.
pub async fn read_frame<T, S>(stream: &mut S) -> Result<T>
where
    T: DeserializeOwned,
    S: AsyncReadExt + Unpin,
{
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME_SIZE {
        return Err(Error::protocol(format!("frame length {} out of range", len)));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    bincode::deserialize(&body).map_err(|e| Error::protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = ReplicateBody {
            priority: 2,
            id: "abc".to_string(),
            database: "db".to_string(),
            chunk: 42,
            source_worker: "w1".to_string(),
        };
        write_frame(&mut a, &RequestHeader::Replica(ReplicaRequestKind::Create))
            .await
            .unwrap();
        write_frame(&mut a, &msg).await.unwrap();
        let hdr: RequestHeader = read_frame(&mut b).await.unwrap();
        assert_eq!(hdr, RequestHeader::Replica(ReplicaRequestKind::Create));
        let body: ReplicateBody = read_frame(&mut b).await.unwrap();
        assert_eq!(body.chunk, 42);
        assert_eq!(body.source_worker, "w1");
    }

    #[tokio::test]
    async fn test_length_prefix_is_little_endian() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, &Status::Queued).await.unwrap();
        let mut raw = [0u8; 4];
        use tokio::io::AsyncReadExt;
        b.read_exact(&mut raw).await.unwrap();
        let n = u32::from_le_bytes(raw);
        assert!(n > 0 && n < 16);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let bogus = (MAX_FRAME_SIZE + 1).to_le_bytes();
        a.write_all(&bogus).await.unwrap();
        let err = read_frame::<Status, _>(&mut b).await.unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&8u32.to_le_bytes()).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);
        assert!(read_frame::<Status, _>(&mut b).await.is_err());
    }
}
