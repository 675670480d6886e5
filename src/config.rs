use std::time::Duration;

/// Tunables of the engine.
///
/// Every field has a sensible default; use the `with_*` setters to change individual values:
/// ```
/// # use imap_engine::EngineConfig;
/// # use std::time::Duration;
/// let config = EngineConfig::default()
///     .with_idle_delay(Duration::from_secs(1))
///     .with_max_messages_per_fetch(50);
/// ```
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How often an open mailbox is polled with `NOOP` when the server has no `IDLE`.
    pub noop_interval: Duration,
    /// Window during which part downloads are collected into one `FETCH`.
    pub delayed_part_fetch: Duration,
    /// Window during which envelope downloads are collected into one `FETCH`.
    pub delayed_envelope_fetch: Duration,
    /// Upper bound of the estimated size of all parts requested by one `FETCH`.
    pub max_bytes_per_fetch: u64,
    /// Upper bound of the number of messages covered by one `FETCH`.
    pub max_messages_per_fetch: usize,
    /// How many part downloads may be in flight on one connection.
    pub max_parallel_part_fetches: usize,
    /// How many tasks may be active on one connection at once.
    pub max_active_tasks: usize,
    /// Quiet period after which an open mailbox enters `IDLE`.
    pub idle_delay: Duration,
    /// Maximal duration of one `IDLE` before it gets restarted.
    pub idle_renewal: Duration,
    /// How many connections may be open at once; mailboxes beyond that share them.
    pub max_connections: usize,
    /// How many responses of one connection are processed per [`Model::poll`](crate::Model::poll).
    pub responses_per_poll: usize,
    /// Refuse to log in over a connection that has not been upgraded with `STARTTLS`.
    pub start_tls_required: bool,
    /// Credentials used without asking; when unset they are requested through
    /// [`Event::AuthRequested`](crate::Event::AuthRequested).
    pub username: Option<String>,
    /// See [`EngineConfig::username`].
    pub password: Option<String>,
    /// Fields sent with `ID` when the server supports it.
    pub client_id: Vec<(String, String)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            noop_interval: Duration::from_secs(2 * 60),
            delayed_part_fetch: Duration::from_millis(50),
            delayed_envelope_fetch: Duration::from_millis(0),
            max_bytes_per_fetch: 1024 * 1024,
            max_messages_per_fetch: 300,
            max_parallel_part_fetches: 10,
            max_active_tasks: 100,
            idle_delay: Duration::from_secs(6),
            idle_renewal: Duration::from_secs(29 * 60),
            responses_per_poll: 100,
            max_connections: 1,
            start_tls_required: false,
            username: None,
            password: None,
            client_id: vec![
                ("name".to_string(), "imap-engine".to_string()),
                ("version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            ],
        }
    }
}

macro_rules! setter {
    ($(#[$doc:meta])* $name:ident, $field:ident: $ty:ty) => {
        $(#[$doc])*
        pub fn $name(mut self, $field: $ty) -> Self {
            self.$field = $field;
            self
        }
    };
}

impl EngineConfig {
    setter!(
        /// Set [`EngineConfig::noop_interval`].
        with_noop_interval, noop_interval: Duration
    );
    setter!(
        /// Set [`EngineConfig::delayed_part_fetch`].
        with_delayed_part_fetch, delayed_part_fetch: Duration
    );
    setter!(
        /// Set [`EngineConfig::delayed_envelope_fetch`].
        with_delayed_envelope_fetch, delayed_envelope_fetch: Duration
    );
    setter!(
        /// Set [`EngineConfig::max_bytes_per_fetch`].
        with_max_bytes_per_fetch, max_bytes_per_fetch: u64
    );
    setter!(
        /// Set [`EngineConfig::max_messages_per_fetch`].
        with_max_messages_per_fetch, max_messages_per_fetch: usize
    );
    setter!(
        /// Set [`EngineConfig::max_parallel_part_fetches`].
        with_max_parallel_part_fetches, max_parallel_part_fetches: usize
    );
    setter!(
        /// Set [`EngineConfig::max_active_tasks`].
        with_max_active_tasks, max_active_tasks: usize
    );
    setter!(
        /// Set [`EngineConfig::idle_delay`].
        with_idle_delay, idle_delay: Duration
    );
    setter!(
        /// Set [`EngineConfig::idle_renewal`].
        with_idle_renewal, idle_renewal: Duration
    );
    setter!(
        /// Set [`EngineConfig::responses_per_poll`].
        with_responses_per_poll, responses_per_poll: usize
    );
    setter!(
        /// Set [`EngineConfig::max_connections`].
        with_max_connections, max_connections: usize
    );
    setter!(
        /// Set [`EngineConfig::start_tls_required`].
        with_start_tls_required, start_tls_required: bool
    );
    setter!(
        /// Set [`EngineConfig::client_id`].
        with_client_id, client_id: Vec<(String, String)>
    );

    /// Use these credentials instead of asking for them.
    pub fn with_credentials<U: Into<String>, P: Into<String>>(mut self, user: U, pass: P) -> Self {
        self.username = Some(user.into());
        self.password = Some(pass.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = EngineConfig::default();
        assert_eq!(c.delayed_part_fetch, Duration::from_millis(50));
        assert_eq!(c.max_messages_per_fetch, 300);
        assert_eq!(c.max_bytes_per_fetch, 1_048_576);
        assert_eq!(c.client_id[0], ("name".to_string(), "imap-engine".to_string()));
    }

    #[test]
    fn setters_chain() {
        let c = EngineConfig::default()
            .with_max_active_tasks(3)
            .with_credentials("u", "p");
        assert_eq!(c.max_active_tasks, 3);
        assert_eq!(c.username.as_deref(), Some("u"));
    }
}
