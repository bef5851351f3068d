use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Semaphore;

use crate::core::error::Result;
use crate::replica::proto::{
    self, DeleteBody, FindAllBody, FindBody, ManagementKind, ReplicaRequestKind, ReplicateBody,
    RequestHeader, ServiceKind, ServiceResponse, ServiceState, Status,
};
use crate::replica::worker::processor::WorkerProcessor;
use crate::replica::worker::request::WorkerTask;

/// The worker-side RPC server: one accept loop, one lightweight task per
/// connection, each running a read-dispatch-reply loop against the
/// shared processor until EOF or an error closes the connection.
pub struct WorkerServer {
    processor: Arc<WorkerProcessor>,
    connections_limit: u32,
}

impl WorkerServer {
    pub fn new(processor: Arc<WorkerProcessor>, connections_limit: u32) -> Self {
        WorkerServer {
            processor,
            connections_limit: connections_limit.max(1),
        }
    }

    /// Construct a server sized per the replication configuration.
    pub fn from_config(
        processor: Arc<WorkerProcessor>,
        config: &crate::core::config::ReplicaConfig,
    ) -> Self {
        WorkerServer::new(processor, config.worker_num_connections_limit)
    }

    /// Bind the service port with address reuse enabled.
    pub fn bind(&self, addr: &str) -> Result<TcpListener> {
        let addr = addr
            .parse()
            .map_err(|_| crate::core::error::Error::config(format!("bad address: {}", addr)))?;
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(self.connections_limit)?)
    }

    /// Accept connections until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.connections_limit as usize));
        loop {
            let permit = permits.clone().acquire_owned().await.expect("semaphore open");
            let (stream, peer) = listener.accept().await?;
            log::debug!("worker server: connection from {}", peer);
            let processor = self.processor.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(processor, stream).await {
                    log::debug!("worker server: connection ended: {}", e);
                }
                drop(permit);
            });
        }
    }
}

/// The per-connection RPC loop: read a header frame, read the typed body
/// when the header calls for one, dispatch to the processor, reply.
async fn serve_connection(processor: Arc<WorkerProcessor>, mut stream: TcpStream) -> Result<()> {
    loop {
        let header: RequestHeader = proto::read_frame(&mut stream).await?;
        match header {
            RequestHeader::Replica(kind) => {
                let response = match kind {
                    ReplicaRequestKind::Create => {
                        let body: ReplicateBody = proto::read_frame(&mut stream).await?;
                        processor.enqueue(
                            body.id,
                            body.priority,
                            WorkerTask::Replicate {
                                database: body.database,
                                chunk: body.chunk,
                                source_worker: body.source_worker,
                            },
                        )
                    }
                    ReplicaRequestKind::Delete => {
                        let body: DeleteBody = proto::read_frame(&mut stream).await?;
                        processor.enqueue(
                            body.id,
                            body.priority,
                            WorkerTask::Delete {
                                database: body.database,
                                chunk: body.chunk,
                            },
                        )
                    }
                    ReplicaRequestKind::Find => {
                        let body: FindBody = proto::read_frame(&mut stream).await?;
                        processor.enqueue(
                            body.id,
                            body.priority,
                            WorkerTask::Find {
                                database: body.database,
                                chunk: body.chunk,
                            },
                        )
                    }
                    ReplicaRequestKind::FindAll => {
                        let body: FindAllBody = proto::read_frame(&mut stream).await?;
                        processor.enqueue(
                            body.id,
                            body.priority,
                            WorkerTask::FindAll {
                                database: body.database,
                            },
                        )
                    }
                };
                proto::write_frame(&mut stream, &response).await?;
            }
            RequestHeader::Management { kind, .. } => {
                let body: proto::ManagementBody = proto::read_frame(&mut stream).await?;
                let response = match kind {
                    ManagementKind::Stop => processor.dequeue_or_cancel(&body.id),
                    ManagementKind::Status => processor.check_status(&body.id),
                };
                proto::write_frame(&mut stream, &response).await?;
            }
            RequestHeader::Service(kind) => {
                let status = match kind {
                    ServiceKind::Suspend => {
                        // may complete asynchronously; failure means the
                        // processor is still accepting work
                        processor.stop();
                        if processor.state() == ServiceState::Running {
                            Status::Failed
                        } else {
                            Status::Success
                        }
                    }
                    ServiceKind::Resume => {
                        processor.run();
                        if processor.state() == ServiceState::Running {
                            Status::Success
                        } else {
                            Status::Failed
                        }
                    }
                    ServiceKind::Status => Status::Success,
                };
                let (num_new, num_in_progress, num_finished) = processor.counters();
                let response = ServiceResponse {
                    status,
                    service_state: processor.state(),
                    num_new,
                    num_in_progress,
                    num_finished,
                };
                proto::write_frame(&mut stream, &response).await?;
            }
        }
    }
}
