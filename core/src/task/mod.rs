use std::cell::RefCell;
use std::rc::Rc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

type MutableJoinSet = Rc<RefCell<JoinSet<()>>>;

/// Owns every long-running task of the process and the token that stops them.
#[derive(Default)]
pub struct Builder {
    join_set: MutableJoinSet,
    shutdown: CancellationToken,
}

impl Builder {
    pub fn new_task(&self, name: &'static str) -> Spawner {
        Spawner {
            name,
            join_set: self.join_set.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn join_all(self) {
        let join_set = self.join_set.take();
        let _ = join_set.join_all().await;
    }
}

pub struct Spawner {
    name: &'static str,
    join_set: MutableJoinSet,
    shutdown: CancellationToken,
}

impl Spawner {
    /// Spawns `task`, dropping it at the next await point once shutdown is requested.
    #[track_caller]
    pub fn spawn<F>(self, task: F)
    where
        F: Future<Output = ()>,
        F: Send + 'static,
    {
        let name = self.name;
        let shutdown = self.shutdown;
        let span = info_span!("task", name);

        self.join_set.borrow_mut().spawn(
            async move {
                tokio::select! {
                    biased;
                    () = task => debug!("Task completed"),
                    () = shutdown.cancelled() => debug!("Task stopped by shutdown"),
                }
            }
            .instrument(span),
        );
    }

    #[track_caller]
    pub fn spawn_on_shutdown<F>(self, task: F)
    where
        F: Future<Output = ()>,
        F: Send + 'static,
    {
        let name = self.name;
        let shutdown = self.shutdown;
        self.join_set.borrow_mut().spawn(
            async move {
                shutdown.cancelled().await;
                task.await;
            }
            .instrument(info_span!("task", name)),
        );
    }
}
