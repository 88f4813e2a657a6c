//! HTTP surface of the node. Mining never runs on a request task: it is
//! handed to the blocking pool, either awaited (`GET /api/mine`) or tracked
//! as a background job that callers poll.

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ledger_core::{chain::ChainStore, Block, FieldValue, Ledger, LedgerError, MineOutcome, Transaction};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::constants::{API_PREFIX, MAX_TRACKED_JOBS};
use crate::error::ApiError;

#[derive(Clone)]
pub(crate) struct AppState {
    ledger: Arc<Ledger>,
    store: Option<Arc<dyn ChainStore>>,
    // Held while copying sealed blocks into the store so writes stay in order.
    persist: Arc<Mutex<()>>,
    required_fields: Arc<[String]>,
    jobs: Arc<RwLock<JobBook>>,
}

impl AppState {
    pub(crate) fn new(
        ledger: Arc<Ledger>,
        store: Option<Arc<dyn ChainStore>>,
        required_fields: Vec<String>,
    ) -> Self {
        Self {
            ledger,
            store,
            persist: Arc::default(),
            required_fields: required_fields.into(),
            jobs: Arc::new(RwLock::new(JobBook::new(MAX_TRACKED_JOBS))),
        }
    }

    #[cfg(test)]
    fn with_job_capacity(mut self, capacity: usize) -> Self {
        self.jobs = Arc::new(RwLock::new(JobBook::new(capacity)));
        self
    }
}

/// Statuses of the most recent mining jobs. Finished jobs are evicted oldest
/// first once `capacity` is reached; running jobs are never evicted.
struct JobBook {
    capacity: usize,
    next_id: u64,
    statuses: HashMap<u64, JobStatus>,
    order: VecDeque<u64>,
}

impl JobBook {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: 0,
            statuses: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Registers a running job, or `None` when every tracked job is still running.
    fn start(&mut self) -> Option<u64> {
        while self.order.len() >= self.capacity {
            let finished = self
                .order
                .iter()
                .position(|id| self.statuses.get(id) != Some(&JobStatus::Running))?;
            if let Some(id) = self.order.remove(finished) {
                self.statuses.remove(&id);
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.statuses.insert(id, JobStatus::Running);
        self.order.push_back(id);
        Some(id)
    }

    fn finish(&mut self, id: u64, status: JobStatus) {
        if let Some(slot) = self.statuses.get_mut(&id) {
            *slot = status;
        }
    }

    fn get(&self, id: u64) -> Option<JobStatus> {
        self.statuses.get(&id).cloned()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum JobStatus {
    Running,
    Mined { index: u64 },
    NothingToMine,
    Rejected,
    Failed { error: String },
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

#[derive(Serialize)]
struct ChainView {
    length: usize,
    chain: Vec<Block>,
}

pub(crate) fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/new_transaction", post(new_transaction))
        .route("/chain", get(chain))
        .route("/pending_tx", get(pending))
        .route("/mine", get(mine))
        .route("/mine/jobs", post(start_mine_job))
        .route("/mine/jobs/{id}", get(mine_job));

    Router::new()
        .route("/health", get(|| async { Json(Health { status: "ok" }) }))
        .nest(API_PREFIX, api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn new_transaction(
    State(state): State<AppState>,
    Json(fields): Json<BTreeMap<String, FieldValue>>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(missing) = state
        .required_fields
        .iter()
        .find(|name| fields.get(name.as_str()).is_none_or(FieldValue::is_empty))
    {
        return Err(ApiError::MissingField(missing.clone()));
    }

    let tx = Transaction::new(fields).map_err(|err| match err {
        LedgerError::NonFiniteField(field) => ApiError::InvalidTransaction(field),
        other => ApiError::Internal(other.into()),
    })?;
    state.ledger.submit(tx);

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Transaction added" })),
    ))
}

async fn chain(State(state): State<AppState>) -> Json<ChainView> {
    let chain = state.ledger.chain();
    Json(ChainView {
        length: chain.len(),
        chain,
    })
}

async fn pending(State(state): State<AppState>) -> Json<Vec<Transaction>> {
    Json(state.ledger.pending())
}

async fn mine(State(state): State<AppState>) -> Result<Response, ApiError> {
    let response = match run_mine(&state).await? {
        MineOutcome::Mined(index) => (
            StatusCode::OK,
            Json(json!({
                "message": format!("Block #{index} mined successfully"),
                "index": index,
            })),
        ),
        MineOutcome::NothingToMine => (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "No transactions to mine" })),
        ),
        MineOutcome::Rejected => (
            StatusCode::CONFLICT,
            Json(json!({ "message": "Block was not mined" })),
        ),
    };
    Ok(response.into_response())
}

async fn start_mine_job(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let id = state.jobs.write().await.start().ok_or(ApiError::TooManyJobs)?;
    info!(job = id, "mining job started");

    let task_state = state.clone();
    tokio::spawn(async move {
        let status = match run_mine(&task_state).await {
            Ok(MineOutcome::Mined(index)) => JobStatus::Mined { index },
            Ok(MineOutcome::NothingToMine) => JobStatus::NothingToMine,
            Ok(MineOutcome::Rejected) => JobStatus::Rejected,
            Err(err) => {
                error!(job = id, error = %err, "mining job failed");
                JobStatus::Failed {
                    error: err.to_string(),
                }
            }
        };
        task_state.jobs.write().await.finish(id, status);
    });

    Ok((StatusCode::ACCEPTED, Json(json!({ "job": id }))))
}

async fn mine_job(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<JobStatus>, ApiError> {
    state
        .jobs
        .read()
        .await
        .get(id)
        .map(Json)
        .ok_or(ApiError::UnknownJob(id))
}

async fn run_mine(state: &AppState) -> anyhow::Result<MineOutcome> {
    let ledger = Arc::clone(&state.ledger);
    let store = state.store.clone();
    let persist = Arc::clone(&state.persist);
    tokio::task::spawn_blocking(move || -> anyhow::Result<MineOutcome> {
        let outcome = ledger.mine()?;
        if let Some(store) = store.as_deref() {
            let _guard = persist.lock();
            // The block is sealed in memory either way; a failed write is
            // retried by the next mine.
            if let Err(err) = sync_store(&ledger, store) {
                warn!(error = %err, "persisting sealed blocks failed");
            }
        }
        Ok(outcome)
    })
    .await
    .context("mining task panicked")?
}

/// Writes every sealed block past the store's tip, in index order. Stops at
/// the first failure so the store never holds a gap.
fn sync_store(ledger: &Ledger, store: &dyn ChainStore) -> anyhow::Result<usize> {
    let next = match store.tip_hash()? {
        Some(_) => store.tip_height()? + 1,
        None => 0,
    };
    let mut written = 0;
    for index in next..ledger.len() as u64 {
        let block = ledger
            .block(index)
            .with_context(|| format!("block {index} missing from ledger"))?;
        store.put_block(&block)?;
        written += 1;
    }
    Ok(written)
}
