use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::{Receiver, Sender, channel};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::{
    constants::{MAX_CODE_SIZE_BYTES, STREAM_CHANNEL_CAPACITY},
    core::{
        catalog::ChallengeCatalog,
        domain::{self, Challenge},
        service::SolutionChecker,
    },
    grpc::models::{
        CancelSubmissionRequest, CancelSubmissionResponse, SubmitSolutionRequest,
        Submission as GrpcSubmission, submit_solution_request::ChallengeSource,
        validation_service_server::ValidationService,
    },
};

#[derive(Clone, Debug)]
pub struct ValidationServiceImpl {
    checker: SolutionChecker,
    catalog: Arc<ChallengeCatalog>,
    in_flight: Arc<DashMap<Uuid, CancellationToken>>,
}

#[tonic::async_trait]
impl ValidationService for ValidationServiceImpl {
    type SubmitSolutionStream = ReceiverStream<Result<GrpcSubmission, Status>>;

    #[tracing::instrument(skip_all)]
    async fn submit_solution(
        &self,
        request: Request<SubmitSolutionRequest>,
    ) -> Result<Response<Self::SubmitSolutionStream>, Status> {
        let request = request.into_inner();
        tracing::info!(
            "Received submission: code_bytes={}, attempt={}",
            request.code.len(),
            request.attempt
        );

        if request.code.len() > MAX_CODE_SIZE_BYTES {
            return Err(Status::invalid_argument(format!(
                "code exceeds {} bytes",
                MAX_CODE_SIZE_BYTES
            )));
        }

        let challenge = self.resolve_challenge(request.challenge_source)?;
        let limits = request.limits.unwrap_or_default();
        if limits.time_ms == Some(0) || limits.output_bytes == Some(0) {
            return Err(Status::invalid_argument("limits must be positive"));
        }
        let limits = self.checker.limits_with(
            limits.time_ms,
            limits.output_bytes.map(|bytes| bytes as usize),
        );

        let submission = domain::Submission::new(&request.code, challenge, limits, request.attempt);
        let (stream_tx, stream_rx) = channel::<Result<GrpcSubmission, Status>>(STREAM_CHANNEL_CAPACITY);
        self.process_valid_request(submission, stream_tx).await;

        Ok(Response::new(ReceiverStream::new(stream_rx)))
    }

    #[tracing::instrument(skip_all)]
    async fn cancel_submission(
        &self,
        request: Request<CancelSubmissionRequest>,
    ) -> Result<Response<CancelSubmissionResponse>, Status> {
        let id = Uuid::parse_str(&request.into_inner().id)
            .map_err(|e| Status::invalid_argument(format!("invalid submission id: {}", e)))?;

        let found = match self.in_flight.get(&id) {
            Some(cancel) => {
                tracing::info!("Cancelling submission {} on request", id);
                cancel.cancel();
                true
            }
            None => false,
        };

        Ok(Response::new(CancelSubmissionResponse { found }))
    }
}

impl ValidationServiceImpl {
    pub fn new(checker: SolutionChecker, catalog: Arc<ChallengeCatalog>) -> Self {
        Self {
            checker,
            catalog,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    fn resolve_challenge(&self, source: Option<ChallengeSource>) -> Result<Arc<Challenge>, Status> {
        match source {
            Some(ChallengeSource::Challenge(challenge)) => {
                Ok(Arc::new(Challenge::try_from(challenge)?))
            }
            Some(ChallengeSource::ChallengeId(id)) => self
                .catalog
                .get(&id)
                .ok_or_else(|| Status::not_found(format!("unknown challenge {:?}", id))),
            None => Err(Status::invalid_argument("Missing required field: challenge")),
        }
    }

    /// Forwards every state of the submission to the client. A client that
    /// goes away cancels the run.
    async fn process_valid_request(
        &self,
        submission: domain::Submission,
        stream_tx: Sender<Result<GrpcSubmission, Status>>,
    ) {
        let id = submission.id;
        let cancel = submission.cancel.clone();
        self.in_flight.insert(id, cancel.clone());

        let res_rx = self.checker.submit(submission).await;
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            forward_states(res_rx, &stream_tx, &cancel).await;
            in_flight.remove(&id);
        });
    }
}

async fn forward_states(
    mut res_rx: Receiver<domain::Submission>,
    stream_tx: &Sender<Result<GrpcSubmission, Status>>,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stream_tx.closed() => {
                tracing::info!("Client went away, cancelling submission");
                cancel.cancel();
                return;
            }
            next = res_rx.recv() => {
                let Some(submission) = next else {
                    return;
                };
                tracing::debug!("Send new state of submission: {}", submission.state.name());
                if stream_tx.send(Ok(submission.into())).await.is_err() {
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}
