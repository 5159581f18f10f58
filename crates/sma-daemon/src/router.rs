//! Static command table: `<verb>_<action>` → handler plus the session-level
//! rule that wraps it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use sma_proto::protocol::{Command, RouteError};
use tracing::{debug, warn};

use crate::bus::InboundMessage;
use crate::handlers::{self, HandlerResult, Outcome};
use crate::session::{Session, SessionEnd};
use crate::supervisor::{TaskName, TaskSupervisor};

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>>;
pub type Handler = for<'a> fn(&'a Session, &'a Command) -> HandlerFuture<'a>;

/// What the session does around a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    Plain,
    /// Cancel every task first; end the session once the host is going down.
    Halt,
    /// Transport endpoint changed; rebuild the session.
    Reconnect,
    /// Re-run the registry poller so it sees the triggered update.
    RefreshRegistry,
}

struct Entry {
    handler: Handler,
    rule: Rule,
}

/// Whether the session keeps going after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    End(SessionEnd),
}

macro_rules! handler {
    ($f:path) => {{
        fn call<'a>(session: &'a Session, cmd: &'a Command) -> HandlerFuture<'a> {
            Box::pin($f(session, cmd))
        }
        call as Handler
    }};
}

pub struct Router {
    table: HashMap<&'static str, Entry>,
}

impl Router {
    pub fn new() -> Self {
        let entries: [(&'static str, Handler, Rule); 23] = [
            ("do_shutdown", handler!(handlers::do_shutdown), Rule::Halt),
            ("do_restart", handler!(handlers::do_restart), Rule::Halt),
            ("do_compose_recreate", handler!(handlers::do_compose_recreate), Rule::Plain),
            ("do_remote_backup", handler!(handlers::do_remote_backup), Rule::Plain),
            ("do_update_supervisor", handler!(handlers::do_update_supervisor), Rule::RefreshRegistry),
            ("do_update_squeezelite", handler!(handlers::do_update_squeezelite), Rule::RefreshRegistry),
            ("set_lms_host", handler!(handlers::set_lms_host), Rule::Reconnect),
            ("set_mqtt_host", handler!(handlers::set_mqtt_host), Rule::Reconnect),
            ("set_mqtt_password", handler!(handlers::set_mqtt_password), Rule::Plain),
            ("set_hass_host", handler!(handlers::set_hass_host), Rule::Plain),
            ("set_hass_bearer", handler!(handlers::set_hass_bearer), Rule::Plain),
            ("set_backup_host", handler!(handlers::set_backup_host), Rule::Plain),
            ("set_backup_password", handler!(handlers::set_backup_password), Rule::Plain),
            ("set_backup_folder", handler!(handlers::set_backup_folder), Rule::Plain),
            ("set_player_name", handler!(handlers::set_player_name), Rule::Plain),
            ("set_eqsetting", handler!(handlers::set_eqsetting), Rule::Plain),
            ("set_eqpreset", handler!(handlers::set_eqpreset), Rule::Plain),
            ("set_volume", handler!(handlers::set_volume), Rule::Plain),
            ("set_hass_switch", handler!(handlers::set_hass_switch), Rule::Plain),
            ("set_gpio_psu_relay", handler!(handlers::set_gpio_psu_relay), Rule::Plain),
            ("set_gpio_mute", handler!(handlers::set_gpio_mute), Rule::Plain),
            ("set_gpio_usb_dac", handler!(handlers::set_gpio_usb_dac), Rule::Plain),
            ("set_gpio_sps", handler!(handlers::set_gpio_sps), Rule::Plain),
        ];
        let table = entries
            .into_iter()
            .map(|(key, handler, rule)| (key, Entry { handler, rule }))
            .collect();
        Self { table }
    }

    #[cfg(test)]
    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.table.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Parse one inbound message and run its handler. Nothing here ends the
    /// process: bad topics and failed handlers are logged and dropped.
    pub async fn dispatch(
        &self,
        session: &Session,
        supervisor: &mut TaskSupervisor,
        msg: &InboundMessage,
    ) -> Flow {
        let cmd = match Command::parse(&msg.topic, &msg.payload, session.topics().node_id()) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("router: {}: {}", msg.topic, e);
                return Flow::Continue;
            }
        };
        let key = cmd.handler_key();
        let entry = match self.table.get(key.as_str()) {
            Some(entry) => entry,
            None => {
                warn!("router: {}", RouteError::UnknownCommand(key));
                return Flow::Continue;
            }
        };
        debug!(
            "router: {} channel={:?} band={:?} payload={:?}",
            key, cmd.channel, cmd.eq_channel, cmd.payload
        );

        if entry.rule == Rule::Halt {
            let cancelled = supervisor.cancel_all().await;
            debug!("router: {} cancelled {} tasks", key, cancelled);
        }

        let outcome = match (entry.handler)(session, &cmd).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("router: {} failed: {:#}", key, e);
                if entry.rule == Rule::Halt {
                    // The host stays up; so does the session.
                    supervisor.start(session);
                }
                return Flow::Continue;
            }
        };

        match (entry.rule, outcome) {
            (Rule::Halt, _) => Flow::End(SessionEnd::Halt),
            (Rule::Reconnect, Outcome::Applied) => Flow::End(SessionEnd::Reconnect),
            (Rule::RefreshRegistry, Outcome::Applied) => {
                supervisor.restart(TaskName::Registry, session).await;
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
