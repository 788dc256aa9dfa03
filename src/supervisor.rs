//! Owns every session for one physical bus, keyed by receive identifier, and
//! routes inbound frames to the session that owns that rx-ID
//! (`SPEC_FULL.md` §4.5).
//!
//! The Supervisor is also the only thing that knows about SID-0x77 companion
//! sessions: it creates one lazily, the first time some main session's
//! negative-response retry actually needs it, rather than spinning up a
//! companion worker thread per device up front.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::catalog::DidCatalog;
use crate::channel::{CanChannel, CanFrame, CanId};
use crate::session::{OpMode, Retry77Hook, Session, SessionConfig};
use crate::sink::PublishSink;

/// Builds a fresh [`PublishSink`] for a session. Called once per session the
/// supervisor spawns (main or SID-0x77 companion) — a sink instance is not
/// shared across sessions.
pub type PublishFactory = dyn Fn() -> Box<dyn PublishSink> + Send + Sync;

/// State shared between the supervisor handle and every session's
/// retry-77 hook closure, so a negative response observed deep inside one
/// session's worker thread can lazily stand up the sibling companion.
struct Shared {
    channel: Arc<Mutex<dyn CanChannel>>,
    publish_factory: Box<PublishFactory>,
    catalog: Mutex<Arc<DidCatalog>>,
    companions: Mutex<HashMap<CanId, Arc<Session>>>,
}

impl Shared {
    /// Returns the SID-0x77 companion session for the device whose main
    /// session transmits on `base_tx_id`, spawning and starting it on first
    /// use. Keyed by the companion's own rx-ID, not the main session's.
    fn ensure_companion(self: &Arc<Self>, base_tx_id: CanId) -> Arc<Session> {
        let config = SessionConfig::vendor77_companion_of(base_tx_id);
        let rx_id = config.rx_id;
        let mut companions = self.companions.lock().unwrap();
        if let Some(existing) = companions.get(&rx_id) {
            return existing.clone();
        }
        let catalog = self.catalog.lock().unwrap().clone();
        let session = Arc::new(Session::spawn(
            config,
            self.channel.clone(),
            catalog,
            (self.publish_factory)(),
            None,
        ));
        session.set_op_mode(OpMode::Service77);
        session.start();
        companions.insert(rx_id, session.clone());
        session
    }
}

/// Owns a set of per-device sessions and, lazily, their SID-0x77 companions,
/// all sharing one physical CAN bus (`SPEC_FULL.md` §4.5, §5).
pub struct Supervisor {
    shared: Arc<Shared>,
    sessions: HashMap<CanId, Session>,
}

impl Supervisor {
    /// Creates a supervisor with no devices registered yet.
    pub fn new(
        channel: Arc<Mutex<dyn CanChannel>>,
        catalog: Arc<DidCatalog>,
        publish_factory: Box<PublishFactory>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                channel,
                publish_factory,
                catalog: Mutex::new(catalog),
                companions: Mutex::new(HashMap::new()),
            }),
            sessions: HashMap::new(),
        }
    }

    /// Registers a new device's main session for `tx_id` and returns its
    /// rx-ID. The worker thread is spawned immediately; the SID-0x77
    /// companion is deferred until the first retry actually needs it.
    pub fn add_device(&mut self, tx_id: CanId) -> CanId {
        let config = SessionConfig::for_tx_id(tx_id);
        let rx_id = config.rx_id;
        let catalog = self.shared.catalog.lock().unwrap().clone();

        let shared = self.shared.clone();
        let hook: Retry77Hook = Arc::new(move |did, payload| {
            let companion = shared.ensure_companion(tx_id);
            companion.write_by_did77(did, payload);
        });

        let session = Session::spawn(
            config,
            self.shared.channel.clone(),
            catalog,
            (self.shared.publish_factory)(),
            Some(hook),
        );
        self.sessions.insert(rx_id, session);
        rx_id
    }

    /// Looks up the main session for `rx_id`, if any. Does not resolve a
    /// SID-0x77 companion's rx-ID — those are reached only through the
    /// retry path, not addressed directly by the host.
    pub fn session(&self, rx_id: CanId) -> Option<&Session> {
        self.sessions.get(&rx_id)
    }

    /// How many main sessions are registered.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Routes one inbound frame to whichever session (main or SID-0x77
    /// companion) owns its identifier. A frame for an unrecognized
    /// identifier is silently dropped; it belongs to other traffic sharing
    /// the bus.
    pub fn on_inbound_frame(&self, frame: CanFrame) {
        if let Some(session) = self.sessions.get(&frame.id) {
            session.on_inbound_frame(frame);
            return;
        }
        if let Some(session) = self.shared.companions.lock().unwrap().get(&frame.id) {
            session.on_inbound_frame(frame);
        }
    }

    /// Starts every registered session. Companions created after this call
    /// are started as part of their lazy creation.
    pub fn start(&self) {
        for session in self.sessions.values() {
            session.start();
        }
        for session in self.shared.companions.lock().unwrap().values() {
            session.start();
        }
    }

    /// Stops every session: cancels schedules and timeouts, abandons any
    /// in-flight exchange, and joins each worker thread (`SPEC_FULL.md` §5).
    pub fn stop(&self) {
        for session in self.sessions.values() {
            session.stop();
        }
        for session in self.shared.companions.lock().unwrap().values() {
            session.stop();
        }
    }

    /// Swaps in a freshly merged catalog on every session, including any
    /// companion created so far, and arms it for companions created later.
    pub fn set_catalog(&self, catalog: Arc<DidCatalog>) {
        *self.shared.catalog.lock().unwrap() = catalog.clone();
        for session in self.sessions.values() {
            session.set_catalog(catalog.clone());
        }
        for session in self.shared.companions.lock().unwrap().values() {
            session.set_catalog(catalog.clone());
        }
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("sessions", &self.sessions.keys().collect::<Vec<_>>())
            .field(
                "companions",
                &self.shared.companions.lock().unwrap().keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}
