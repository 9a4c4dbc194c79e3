//! gRPC transport for the intake relay.
//!
//! Requests and responses carry the JSON wire messages as bytes, so a
//! network client sees exactly the `patient-update` / `staff-update`
//! messages the library exchanges in process.

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::channel::DistributionChannel;
use crate::error::{ChannelError, IntakeError, RecordError, ValidationError};
use crate::session::IntakeSession;
use crate::snapshot::Snapshot;
use crate::wire::{self, WireMessage};

#[allow(missing_docs, clippy::pedantic)]
pub mod proto {
    tonic::include_proto!("intake");
}

use proto::intake_relay_server::{IntakeRelay, IntakeRelayServer};

/// Buffered `staff-update` messages per streaming client.
const STREAM_BUFFER: usize = 128;

/// How often an idle stream checks for a departed client.
const STREAM_POLL: Duration = Duration::from_secs(5);

/// Maximum length of a field name in an `Edit` request.
const MAX_FIELD_NAME_LEN: usize = 64;

/// gRPC service in front of one intake session and its channel.
pub struct IntakeRelayService {
    session: IntakeSession,
    channel: Arc<dyn DistributionChannel>,
}

impl IntakeRelayService {
    /// `channel` must be the channel `session` publishes to.
    #[must_use]
    pub fn new(session: IntakeSession, channel: Arc<dyn DistributionChannel>) -> Self {
        Self { session, channel }
    }

    /// Wraps the service for `tonic::transport::Server::add_service`.
    #[must_use]
    pub fn into_server(self) -> IntakeRelayServer<Self> {
        IntakeRelayServer::new(self)
    }
}

fn invalid_argument(msg: impl Into<String>) -> Status {
    Status::invalid_argument(msg.into())
}

fn status_from_intake_error(err: IntakeError) -> Status {
    match err {
        IntakeError::Record(e @ RecordError::ImmutableRecord { .. }) => Status::failed_precondition(e.to_string()),
        IntakeError::Validation(v) => match v {
            ValidationError::PayloadTooLarge { .. } => Status::resource_exhausted(v.to_string()),
            ValidationError::InvalidConfig { .. } => Status::internal(v.to_string()),
            ValidationError::UnknownField { .. }
            | ValidationError::Submission { .. }
            | ValidationError::MalformedMessage { .. } => Status::invalid_argument(v.to_string()),
        },
        IntakeError::Channel(c) => match c {
            ChannelError::SubscriptionNotFound { .. } => Status::not_found(c.to_string()),
            ChannelError::Timeout { .. } => Status::deadline_exceeded(c.to_string()),
            ChannelError::Disconnected { .. } => Status::unavailable(c.to_string()),
            ChannelError::Delivery { .. } => Status::internal(c.to_string()),
        },
        IntakeError::Collaborator(c) => Status::unavailable(c.to_string()),
        IntakeError::Internal { message } => Status::internal(message),
    }
}

fn staff_update_json(snapshot: Snapshot) -> Result<Vec<u8>, Status> {
    wire::encode(&WireMessage::StaffUpdate(snapshot)).map_err(status_from_intake_error)
}

// Session calls only hold the record mutex briefly, so handlers call them inline.
#[tonic::async_trait]
impl IntakeRelay for IntakeRelayService {
    async fn patient_update(
        &self,
        request: Request<proto::PatientUpdateRequest>,
    ) -> Result<Response<proto::SnapshotResponse>, Status> {
        let req = request.into_inner();
        let WireMessage::PatientUpdate(record) = wire::decode(&req.message_json).map_err(status_from_intake_error)?
        else {
            return Err(invalid_argument("PatientUpdateRequest must carry a patient-update message"));
        };

        let snapshot = self.session.ingest(&record).map_err(status_from_intake_error)?;
        Ok(Response::new(proto::SnapshotResponse {
            message_json: staff_update_json(snapshot)?,
        }))
    }

    async fn edit(&self, request: Request<proto::EditRequest>) -> Result<Response<proto::SnapshotResponse>, Status> {
        let req = request.into_inner();
        if req.field.len() > MAX_FIELD_NAME_LEN {
            return Err(invalid_argument("field name too long"));
        }
        if req.value.len() > wire::MAX_MESSAGE_BYTES {
            return Err(Status::resource_exhausted("field value exceeds maximum size"));
        }

        let snapshot = self
            .session
            .apply_edit_named(&req.field, req.value)
            .map_err(status_from_intake_error)?;
        Ok(Response::new(proto::SnapshotResponse {
            message_json: staff_update_json(snapshot)?,
        }))
    }

    async fn submit(&self, request: Request<proto::SubmitRequest>) -> Result<Response<proto::SubmitResponse>, Status> {
        let req = request.into_inner();
        let outcome = if req.validate {
            self.session.submit_validated()
        } else {
            self.session.mark_submitted()
        };

        match outcome {
            Ok(Some(snapshot)) => Ok(Response::new(proto::SubmitResponse {
                submitted: true,
                changed: true,
                message_json: staff_update_json(snapshot)?,
                issues_json: Vec::new(),
            })),
            Ok(None) => Ok(Response::new(proto::SubmitResponse {
                submitted: true,
                changed: false,
                message_json: Vec::new(),
                issues_json: Vec::new(),
            })),
            Err(IntakeError::Validation(ValidationError::Submission { issues })) => {
                let issues_json = serde_json::to_vec(&issues)
                    .map_err(|e| Status::internal(format!("failed to serialize field issues: {e}")))?;
                Ok(Response::new(proto::SubmitResponse {
                    submitted: false,
                    changed: false,
                    message_json: Vec::new(),
                    issues_json,
                }))
            }
            Err(err) => Err(status_from_intake_error(err)),
        }
    }

    async fn reset(&self, _request: Request<proto::ResetRequest>) -> Result<Response<proto::SnapshotResponse>, Status> {
        let snapshot = self.session.reset().map_err(status_from_intake_error)?;
        Ok(Response::new(proto::SnapshotResponse {
            message_json: staff_update_json(snapshot)?,
        }))
    }

    async fn summary(
        &self,
        _request: Request<proto::SummaryRequest>,
    ) -> Result<Response<proto::SummaryResponse>, Status> {
        // The generator is an external request/response call.
        let session = self.session.clone();
        let summary = tokio::task::spawn_blocking(move || session.summary())
            .await
            .map_err(|e| Status::internal(format!("summary task failed: {e}")))?
            .map_err(status_from_intake_error)?;
        Ok(Response::new(proto::SummaryResponse { summary }))
    }

    type StaffUpdatesStream = ReceiverStream<Result<proto::StaffUpdate, Status>>;

    async fn staff_updates(
        &self,
        _request: Request<proto::StaffUpdatesRequest>,
    ) -> Result<Response<Self::StaffUpdatesStream>, Status> {
        let handle = self.channel.subscribe().map_err(status_from_intake_error)?;
        let subscription_id = handle.subscription_id();
        debug!(%subscription_id, "staff stream opened");

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<proto::StaffUpdate, Status>>(STREAM_BUFFER);
        tokio::task::spawn_blocking(move || loop {
            match handle.recv_timeout(STREAM_POLL) {
                Ok(snapshot) => {
                    let message_json = match staff_update_json(snapshot) {
                        Ok(bytes) => bytes,
                        Err(status) => {
                            let _ = tx.blocking_send(Err(status));
                            handle.unsubscribe();
                            break;
                        }
                    };
                    if tx.blocking_send(Ok(proto::StaffUpdate { message_json })).is_err() {
                        handle.unsubscribe();
                        break;
                    }
                }
                Err(IntakeError::Channel(ChannelError::Timeout { .. })) => {
                    if tx.is_closed() {
                        handle.unsubscribe();
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.blocking_send(Err(status_from_intake_error(err)));
                    handle.unsubscribe();
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}


pub use proto::intake_relay_client::IntakeRelayClient;
