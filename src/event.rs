use color_eyre::{eyre::eyre, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::agent::{Agent, Interception};
use crate::cache::CacheStorage;
use crate::net::{Network, Request};

/// Events the host delivers to the agent
#[derive(Debug)]
pub enum Event {
  /// A new version was registered
  Install,
  /// The installed version is being promoted
  Activate,
  /// The page issued a request
  Fetch(Request),
}

impl Event {
  fn name(&self) -> &'static str {
    match self {
      Event::Install => "install",
      Event::Activate => "activate",
      Event::Fetch(_) => "fetch",
    }
  }
}

/// Result of handling an event
#[derive(Debug)]
pub enum EventOutcome {
  /// Number of assets pre-cached
  Installed(usize),
  /// Names of the stale buckets that were deleted
  Activated(Vec<String>),
  Fetched(Interception),
}

struct Envelope {
  event: Event,
  reply: oneshot::Sender<Result<EventOutcome>>,
}

/// Delivers events to an agent one at a time.
///
/// Handler bodies never overlap: each event is fully handled, including
/// the install and activate work it waits on, before the next one starts.
pub struct EventLoop {
  tx: mpsc::UnboundedSender<Envelope>,
}

impl EventLoop {
  /// Spawn the dispatch task that owns the agent
  pub fn spawn<S, N>(agent: Agent<S, N>) -> Self
  where
    S: CacheStorage + 'static,
    N: Network + 'static,
  {
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    tokio::spawn(async move {
      while let Some(Envelope { event, reply }) = rx.recv().await {
        debug!(event = event.name(), version = agent.version(), "Dispatching");
        let result = agent.handle(event).await;
        // Ignore send errors - the caller may have stopped waiting
        let _ = reply.send(result);
      }
    });

    Self { tx }
  }

  /// Deliver an event and wait for its handler to finish
  pub async fn dispatch(&self, event: Event) -> Result<EventOutcome> {
    let name = event.name();
    let (reply, rx) = oneshot::channel();

    self
      .tx
      .send(Envelope { event, reply })
      .map_err(|_| eyre!("Event loop has shut down"))?;

    rx.await
      .map_err(|_| eyre!("Event loop dropped the {} event", name))?
  }

  pub async fn install(&self) -> Result<usize> {
    match self.dispatch(Event::Install).await? {
      EventOutcome::Installed(count) => Ok(count),
      other => Err(unexpected("install", &other)),
    }
  }

  pub async fn activate(&self) -> Result<Vec<String>> {
    match self.dispatch(Event::Activate).await? {
      EventOutcome::Activated(deleted) => Ok(deleted),
      other => Err(unexpected("activate", &other)),
    }
  }

  pub async fn fetch(&self, request: Request) -> Result<Interception> {
    match self.dispatch(Event::Fetch(request)).await? {
      EventOutcome::Fetched(interception) => Ok(interception),
      other => Err(unexpected("fetch", &other)),
    }
  }
}

fn unexpected(event: &str, outcome: &EventOutcome) -> color_eyre::Report {
  eyre!("Unexpected outcome for {} event: {:?}", event, outcome)
}
