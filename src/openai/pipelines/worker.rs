//! The inference worker: a dedicated OS thread that owns the model backend.
//!
//! Requests are queued FIFO on a flume channel and served strictly one at a
//! time. Each job carries its own reply channel; a failed send on that channel
//! means the client went away and the worker moves on to the next job.
use super::{BackendError, BackendKind, ModelBackend, ModelOutput};
use crate::openai::conversation::NormalizedConversation;
use crate::openai::sampling_params::SamplingParams;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// What the worker reports back for one job. Every job ends with exactly one
/// of `Finished`, `Completed` or `Failed`, unless the client disconnected.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Incremental text, streaming jobs only
    Fragment(String),
    /// End of a streaming job
    Finished,
    /// Whole answer of a non-streaming job, counted with the backend tokenizer
    Completed {
        text: String,
        completion_tokens: usize,
    },
    Failed(BackendError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendStatus {
    Loading,
    Ready,
    Failed(String),
}

impl BackendStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, BackendStatus::Ready)
    }
}

struct Job {
    request_id: String,
    conversation: NormalizedConversation,
    params: SamplingParams,
    stream: bool,
    reply: flume::Sender<WorkerEvent>,
    cancelled: Arc<AtomicBool>,
}

impl Job {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Flags the job as abandoned when dropped. A queued job that is cancelled
/// never reaches the model; a streaming job stops pulling fragments.
#[derive(Debug)]
pub struct CancelOnDrop(Arc<AtomicBool>);

impl CancelOnDrop {
    pub fn new(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A submitted job: its event channel plus the guard that cancels it.
pub struct Submission {
    pub events: flume::Receiver<WorkerEvent>,
    pub guard: CancelOnDrop,
}

/// Cheap, cloneable handle to the worker thread.
#[derive(Clone)]
pub struct WorkerHandle {
    kind: BackendKind,
    jobs: flume::Sender<Job>,
    status: Arc<RwLock<BackendStatus>>,
}

impl WorkerHandle {
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn status(&self) -> BackendStatus {
        self.status.read().clone()
    }

    /// Jobs waiting behind the one currently being served.
    pub fn queued(&self) -> usize {
        self.jobs.len()
    }

    pub fn submit(
        &self,
        request_id: String,
        conversation: NormalizedConversation,
        params: SamplingParams,
        stream: bool,
    ) -> Result<Submission, BackendError> {
        let (reply, events) = flume::unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));
        let job = Job {
            request_id,
            conversation,
            params,
            stream,
            reply,
            cancelled: cancelled.clone(),
        };
        self.jobs
            .send(job)
            .map_err(|_| BackendError::Unavailable("inference worker has stopped".to_string()))?;
        Ok(Submission {
            events,
            guard: CancelOnDrop::new(cancelled),
        })
    }
}

pub struct InferenceWorker;

impl InferenceWorker {
    /// Start the worker thread and load the backend on it.
    ///
    /// The returned receiver resolves once loading finished, successfully or
    /// not. A failed load leaves the worker running and answering every job
    /// with [`BackendError::Unavailable`].
    pub fn spawn<F>(
        kind: BackendKind,
        loader: F,
    ) -> std::io::Result<(WorkerHandle, oneshot::Receiver<Result<(), BackendError>>)>
    where
        F: FnOnce(BackendKind) -> Result<ModelBackend, BackendError> + Send + 'static,
    {
        let (jobs_tx, jobs_rx) = flume::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();
        let status = Arc::new(RwLock::new(BackendStatus::Loading));
        let thread_status = status.clone();
        std::thread::Builder::new()
            .name("inference".to_string())
            .spawn(move || run(kind, loader, jobs_rx, thread_status, ready_tx))?;
        Ok((
            WorkerHandle {
                kind,
                jobs: jobs_tx,
                status,
            },
            ready_rx,
        ))
    }
}

fn run<F>(
    kind: BackendKind,
    loader: F,
    jobs: flume::Receiver<Job>,
    status: Arc<RwLock<BackendStatus>>,
    ready: oneshot::Sender<Result<(), BackendError>>,
) where
    F: FnOnce(BackendKind) -> Result<ModelBackend, BackendError>,
{
    info!("Loading {} backend", kind);
    let loaded = match catch_unwind(AssertUnwindSafe(|| loader(kind))) {
        Ok(result) => result,
        Err(_) => Err(BackendError::Unavailable(
            "backend loader panicked".to_string(),
        )),
    };
    let mut backend = match loaded {
        Ok(backend) => {
            *status.write() = BackendStatus::Ready;
            let _ = ready.send(Ok(()));
            Ok(backend)
        }
        Err(e) => {
            error!("Failed to load {} backend: {}", kind, e);
            *status.write() = BackendStatus::Failed(e.to_string());
            let _ = ready.send(Err(e.clone()));
            Err(match e {
                BackendError::Unavailable(_) => e,
                other => BackendError::Unavailable(other.to_string()),
            })
        }
    };

    info!("Inference worker ready, processing requests...");
    while let Ok(job) = jobs.recv() {
        if job.is_cancelled() {
            debug!("[{}] client left before the job started, skipping", job.request_id);
            continue;
        }
        let model = match backend.as_mut() {
            Ok(model) => model,
            Err(e) => {
                let _ = job.reply.send(WorkerEvent::Failed(e.clone()));
                continue;
            }
        };

        let start = Instant::now();
        if catch_unwind(AssertUnwindSafe(|| serve(model, &job))).is_err() {
            error!("[{}] backend panicked during generation", job.request_id);
            let _ = job.reply.send(WorkerEvent::Failed(BackendError::Generation(
                "model panicked during generation".to_string(),
            )));
        }
        debug!(
            "[{}] served in {:.2}s, {} queued",
            job.request_id,
            start.elapsed().as_secs_f32(),
            jobs.len()
        );
    }
    info!("Inference worker exiting");
}

fn serve(backend: &mut ModelBackend, job: &Job) {
    let text = match generate(backend, job) {
        Ok(Some(text)) => text,
        Ok(None) => return,
        Err(e) => {
            warn!("[{}] generation failed: {}", job.request_id, e);
            let _ = job.reply.send(WorkerEvent::Failed(e));
            return;
        }
    };

    if job.stream {
        info!("[{}] stream finished, {} bytes", job.request_id, text.len());
        let _ = job.reply.send(WorkerEvent::Finished);
        return;
    }

    // Counted on the raw model output, before any script conversion.
    let event = match backend.count_tokens(&text) {
        Ok(completion_tokens) => {
            info!("[{}] generated {} tokens", job.request_id, completion_tokens);
            WorkerEvent::Completed {
                text,
                completion_tokens,
            }
        }
        Err(e) => {
            error!("[{}] token count failed: {}", job.request_id, e);
            WorkerEvent::Failed(e)
        }
    };
    let _ = job.reply.send(event);
}

/// Run the backend and, for streaming jobs, forward fragments as they come.
/// `Ok(None)` means the client is gone and nothing more should be sent.
fn generate(backend: &mut ModelBackend, job: &Job) -> Result<Option<String>, BackendError> {
    match backend.chat(&job.conversation, &job.params, job.stream)? {
        ModelOutput::Complete(text) => {
            if job.stream && job.reply.send(WorkerEvent::Fragment(text.clone())).is_err() {
                debug!("[{}] client disconnected", job.request_id);
                return Ok(None);
            }
            Ok(Some(text))
        }
        ModelOutput::Stream(fragments) => {
            let mut text = String::new();
            for fragment in fragments {
                if job.is_cancelled() {
                    debug!("[{}] cancelled mid-stream", job.request_id);
                    return Ok(None);
                }
                let fragment = fragment?;
                text.push_str(&fragment);
                if job.stream && job.reply.send(WorkerEvent::Fragment(fragment)).is_err() {
                    debug!("[{}] client disconnected", job.request_id);
                    return Ok(None);
                }
            }
            Ok(Some(text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::conversation::{normalize, NormalizedTurn};
    use crate::openai::pipelines::echo::{whitespace_tokenizer, EchoModel};
    use crate::openai::pipelines::{MultiTurnModel, TokenCounter};
    use crate::openai::requests::ChatMessage;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Echo model that records calls and misbehaves on request.
    struct ScriptedModel {
        inner: EchoModel,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl MultiTurnModel for ScriptedModel {
        fn chat<'a>(
            &'a mut self,
            system_prompt: &str,
            turns: &[NormalizedTurn],
            params: &SamplingParams,
            stream: bool,
        ) -> Result<ModelOutput<'a>, BackendError> {
            let last = turns.last().map(NormalizedTurn::text).unwrap_or_default();
            self.calls.lock().push(last.clone());
            match last.as_str() {
                "panic" => panic!("scripted panic"),
                "fail" => Err(BackendError::Generation("scripted failure".to_string())),
                "slow" => {
                    std::thread::sleep(Duration::from_millis(50));
                    MultiTurnModel::chat(&mut self.inner, system_prompt, turns, params, stream)
                }
                _ => MultiTurnModel::chat(&mut self.inner, system_prompt, turns, params, stream),
            }
        }

        fn tokenizer(&self) -> &dyn TokenCounter {
            MultiTurnModel::tokenizer(&self.inner)
        }
    }

    /// Tokenizer that always fails, for the usage-count error path.
    struct BrokenTokenizer;

    impl TokenCounter for BrokenTokenizer {
        fn tokenize(&self, _text: &str) -> Result<Vec<u32>, BackendError> {
            Err(BackendError::Tokenizer("vocabulary missing".to_string()))
        }
    }

    struct UncountableModel(EchoModel);

    impl MultiTurnModel for UncountableModel {
        fn chat<'a>(
            &'a mut self,
            system_prompt: &str,
            turns: &[NormalizedTurn],
            params: &SamplingParams,
            stream: bool,
        ) -> Result<ModelOutput<'a>, BackendError> {
            MultiTurnModel::chat(&mut self.0, system_prompt, turns, params, stream)
        }

        fn tokenizer(&self) -> &dyn TokenCounter {
            &BrokenTokenizer
        }
    }

    fn spawn_scripted(delay: Duration) -> (WorkerHandle, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let model = ScriptedModel {
            inner: EchoModel::new(whitespace_tokenizer().unwrap(), delay),
            calls: calls.clone(),
        };
        let (handle, ready) = InferenceWorker::spawn(BackendKind::MiniCpmV25, move |_| {
            Ok(ModelBackend::MultiTurn(Box::new(model)))
        })
        .unwrap();
        ready.blocking_recv().unwrap().unwrap();
        (handle, calls)
    }

    fn submit(handle: &WorkerHandle, text: &str, stream: bool) -> Submission {
        let conversation = normalize(&[ChatMessage::user(text)]).unwrap();
        handle
            .submit(
                format!("req-{text}"),
                conversation,
                SamplingParams::default(),
                stream,
            )
            .unwrap()
    }

    fn drain(submission: &Submission) -> Vec<WorkerEvent> {
        submission.events.iter().collect()
    }

    #[test]
    fn non_streaming_job_completes_with_token_count() {
        let (handle, _) = spawn_scripted(Duration::ZERO);
        assert!(handle.status().is_ready());
        let job = submit(&handle, "hello there world", false);
        assert_eq!(
            drain(&job),
            vec![WorkerEvent::Completed {
                text: "hello there world".to_string(),
                completion_tokens: 3,
            }]
        );
    }

    #[test]
    fn streaming_job_sends_fragments_then_finished() {
        let (handle, _) = spawn_scripted(Duration::ZERO);
        let job = submit(&handle, "a b c", true);
        assert_eq!(
            drain(&job),
            vec![
                WorkerEvent::Fragment("a".into()),
                WorkerEvent::Fragment(" b".into()),
                WorkerEvent::Fragment(" c".into()),
                WorkerEvent::Finished,
            ]
        );
    }

    #[test]
    fn jobs_are_served_in_submission_order() {
        let (handle, calls) = spawn_scripted(Duration::ZERO);
        let jobs: Vec<_> = ["slow", "second", "third"]
            .iter()
            .map(|t| submit(&handle, t, false))
            .collect();
        for job in &jobs {
            assert_eq!(drain(job).len(), 1);
        }
        assert_eq!(*calls.lock(), vec!["slow", "second", "third"]);
    }

    #[test]
    fn cancelled_queued_job_never_reaches_model() {
        let (handle, calls) = spawn_scripted(Duration::ZERO);
        let blocker = submit(&handle, "slow", false);
        let abandoned = submit(&handle, "abandoned", false);
        drop(abandoned);
        let after = submit(&handle, "after", false);
        drain(&blocker);
        drain(&after);
        assert_eq!(*calls.lock(), vec!["slow", "after"]);
    }

    #[test]
    fn disconnected_stream_does_not_stall_worker() {
        let (handle, _) = spawn_scripted(Duration::from_millis(5));
        let job = submit(&handle, "many words to stream out here", true);
        assert!(matches!(job.events.recv().unwrap(), WorkerEvent::Fragment(_)));
        drop(job);
        let next = submit(&handle, "next", false);
        assert!(matches!(
            drain(&next).as_slice(),
            [WorkerEvent::Completed { .. }]
        ));
    }

    #[test]
    fn generation_errors_and_panics_are_reported() {
        let (handle, _) = spawn_scripted(Duration::ZERO);
        let failed = submit(&handle, "fail", false);
        assert!(matches!(
            drain(&failed).as_slice(),
            [WorkerEvent::Failed(BackendError::Generation(_))]
        ));
        let panicked = submit(&handle, "panic", true);
        assert!(matches!(
            drain(&panicked).as_slice(),
            [WorkerEvent::Failed(BackendError::Generation(_))]
        ));
        // still serving
        let ok = submit(&handle, "fine", false);
        assert!(matches!(
            drain(&ok).as_slice(),
            [WorkerEvent::Completed { .. }]
        ));
    }

    #[test]
    fn failed_load_answers_unavailable() {
        let (handle, ready) = InferenceWorker::spawn(BackendKind::MiniCpmV, |_| {
            Err(BackendError::Unavailable("weights not found".to_string()))
        })
        .unwrap();
        assert!(ready.blocking_recv().unwrap().is_err());
        assert_eq!(
            handle.status(),
            BackendStatus::Failed("model backend unavailable: weights not found".to_string())
        );
        let job = submit(&handle, "hello", false);
        assert_eq!(
            drain(&job),
            vec![WorkerEvent::Failed(BackendError::Unavailable(
                "weights not found".to_string()
            ))]
        );
    }

    #[test]
    fn token_count_failure_fails_the_job() {
        let model = UncountableModel(EchoModel::new(
            whitespace_tokenizer().unwrap(),
            Duration::ZERO,
        ));
        let (handle, ready) = InferenceWorker::spawn(BackendKind::MiniCpmV25, move |_| {
            Ok(ModelBackend::MultiTurn(Box::new(model)))
        })
        .unwrap();
        ready.blocking_recv().unwrap().unwrap();

        let job = submit(&handle, "hello there", false);
        assert_eq!(
            drain(&job),
            vec![WorkerEvent::Failed(BackendError::Tokenizer(
                "vocabulary missing".to_string()
            ))]
        );

        // streamed answers carry no usage, so the tokenizer is never consulted
        let streamed = submit(&handle, "hello there", true);
        assert_eq!(
            drain(&streamed),
            vec![
                WorkerEvent::Fragment("hello".into()),
                WorkerEvent::Fragment(" there".into()),
                WorkerEvent::Finished,
            ]
        );
    }
}
