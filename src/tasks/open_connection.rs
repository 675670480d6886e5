use super::{check_abort_die, completes, EnableTask, IdTask, ImapTask, TaskKind};
use crate::error::{Error, Result};
use crate::model::{Credentials, Model};
use crate::parser::Command;
use crate::types::{ConnId, ConnectionState, Event, RespCode, StateKind, StateResponse, Tag, TaskId};

/// Takes a fresh connection from the greeting to the authenticated state.
///
/// Along the way it asks for `CAPABILITY` whenever the server did not volunteer it, upgrades
/// the connection with `STARTTLS` when required, has the consumer vet the TLS certificate chain
/// and logs in with the credentials the model holds (asking for them if needed).
///
/// Once authenticated, `ID` and `ENABLE QRESYNC` are queued ahead of everything else that
/// waited for the connection, provided the server supports them.
#[derive(Debug, Default)]
pub(crate) struct OpenConnectionTask {
    capability_cmd: Option<Tag>,
    starttls_cmd: Option<Tag>,
    login_cmd: Option<Tag>,
    /// Certificate chain and validation problems the consumer has yet to decide on.
    pending_ssl: Option<(Vec<Vec<u8>>, Vec<String>)>,
    waiting_for_credentials: bool,
}

impl OpenConnectionTask {
    pub(crate) fn new() -> Self {
        OpenConnectionTask::default()
    }

    fn logout(&mut self, model: &mut Model, me: TaskId, conn: ConnId, message: &str) {
        model.task_failed(me, message);
        model.logout_connection(conn, message);
    }

    fn ask_for_capabilities(&mut self, model: &mut Model, conn: ConnId) -> Result<()> {
        if let Some(c) = model.conn_mut(conn) {
            c.capabilities_fresh = false;
        }
        self.capability_cmd = Some(model.send(conn, Command::Capability)?);
        Ok(())
    }

    /// Look at the completion of our `CAPABILITY`; `false` means the connection is being torn
    /// down.
    fn check_caps(&mut self, model: &mut Model, me: TaskId, conn: ConnId, resp: &StateResponse) -> bool {
        self.capability_cmd = None;
        if resp.kind != StateKind::Ok {
            self.logout(model, me, conn, "CAPABILITIES command has failed");
            return false;
        }
        if !model.conn(conn).map(|c| c.capabilities_fresh()).unwrap_or(false) {
            self.logout(model, me, conn, "Server did not provide useful capabilities");
            return false;
        }
        true
    }

    fn start_tls_or_login(&mut self, model: &mut Model, me: TaskId, conn: ConnId) -> Result<()> {
        let encrypted = model.conn(conn).map(|c| c.is_encrypted()).unwrap_or(false);
        let wants_tls = !encrypted
            && (model.start_tls_required() || model.has_capability(conn, "LOGINDISABLED"));
        if wants_tls {
            if model.has_capability(conn, "STARTTLS") {
                model.set_conn_state(conn, ConnectionState::StartTlsIssued);
                self.starttls_cmd = Some(model.send(conn, Command::StartTls)?);
            } else {
                self.logout(model, me, conn, "Server does not support STARTTLS");
            }
            return Ok(());
        }
        model.set_conn_state(conn, ConnectionState::Login);
        self.ask_for_auth(model, me, conn, None)
    }

    fn ask_for_auth(
        &mut self,
        model: &mut Model,
        me: TaskId,
        conn: ConnId,
        error: Option<String>,
    ) -> Result<()> {
        match model.credentials().clone() {
            Credentials::Available { username, password } => {
                self.waiting_for_credentials = false;
                if let Some(c) = model.conn_mut(conn) {
                    c.capabilities_fresh = false;
                }
                self.login_cmd = Some(model.send(conn, Command::Login { username, password })?);
            }
            Credentials::Cancelled => {
                self.waiting_for_credentials = false;
                self.logout(model, me, conn, "No credentials available");
            }
            Credentials::Missing => {
                if !self.waiting_for_credentials {
                    self.waiting_for_credentials = true;
                    model.request_credentials(conn, error);
                }
            }
        }
        Ok(())
    }

    fn authenticated(&mut self, model: &mut Model, me: TaskId, conn: ConnId) {
        model.set_conn_state(conn, ConnectionState::Authenticated);
        if model.has_capability(conn, "QRESYNC") && model.has_capability(conn, "ENABLE") {
            let enable = model.create_task(
                TaskKind::Enable,
                Box::new(EnableTask::new(vec!["QRESYNC".to_string()])),
            );
            model.add_dependent_first(me, enable);
        }
        if model.has_capability(conn, "ID") {
            let fields = model.config().client_id.clone();
            let id = model.create_task(TaskKind::Id, Box::new(IdTask::new(fields)));
            model.add_dependent_first(me, id);
        }
        model.task_completed(me);
    }

    fn after_capabilities(&mut self, model: &mut Model, me: TaskId, conn: ConnId) -> Result<()> {
        if model.conn(conn).map(|c| c.capabilities_fresh()).unwrap_or(false) {
            self.authenticated(model, me, conn);
            Ok(())
        } else {
            model.set_conn_state(conn, ConnectionState::PostauthPrecaps);
            self.ask_for_capabilities(model, conn)
        }
    }

    fn handle_greeting(
        &mut self,
        model: &mut Model,
        me: TaskId,
        conn: ConnId,
        resp: &StateResponse,
    ) -> Result<bool> {
        if resp.tag.is_some() {
            return Err(Error::ProtocolViolation(
                "Waiting for initial OK/BYE/PREAUTH, but got tagged response instead".to_string(),
            ));
        }
        model.set_conn_state(conn, ConnectionState::ConnectedPretlsPrecaps);
        match resp.kind {
            StateKind::PreAuth => {
                if model.start_tls_required() {
                    self.logout(
                        model,
                        me,
                        conn,
                        "Configuration requires sending STARTTLS, but the IMAP server greets us \
                         with PREAUTH. Encryption cannot be established. If this configuration \
                         worked previously, someone is after your data and they are pretty smart.",
                    );
                } else {
                    self.after_capabilities(model, me, conn)?;
                }
            }
            StateKind::Ok => {
                if model.conn(conn).map(|c| c.capabilities_fresh()).unwrap_or(false) {
                    self.start_tls_or_login(model, me, conn)?;
                } else {
                    model.set_conn_state(conn, ConnectionState::ConnectedPretls);
                    self.ask_for_capabilities(model, conn)?;
                }
            }
            StateKind::Bye => self.logout(model, me, conn, "Server has closed the connection"),
            StateKind::Bad => {
                model.set_conn_state(conn, ConnectionState::Logout);
                if resp.code != Some(RespCode::Alert) {
                    model.emit(Event::Alert {
                        conn,
                        message: format!(
                            "The server replied with the following BAD response:\n{}",
                            resp.message
                        ),
                    });
                }
                self.logout(model, me, conn, "Server has greeted us with a BAD response");
            }
            StateKind::No => {
                return Err(Error::ProtocolViolation(format!(
                    "Waiting for initial OK/BYE/BAD/PREAUTH, but got this instead: NO {}",
                    resp.message
                )))
            }
        }
        Ok(true)
    }

    fn handle_login_result(
        &mut self,
        model: &mut Model,
        me: TaskId,
        conn: ConnId,
        resp: &StateResponse,
    ) -> Result<()> {
        self.login_cmd = None;
        if resp.kind == StateKind::Ok {
            return self.after_capabilities(model, me, conn);
        }

        let explanation = match resp.code {
            Some(RespCode::Unavailable) => Some("Temporary failure because a subsystem is down."),
            Some(RespCode::AuthenticationFailed) => Some(
                "Authentication failed.  This often happens due to bad password or wrong user name.",
            ),
            Some(RespCode::AuthorizationFailed) => Some(
                "Authentication succeeded in using the authentication identity, but the server \
                 cannot or will not allow the authentication identity to act as the requested \
                 authorization identity.",
            ),
            Some(RespCode::Expired) => Some(
                "Either authentication succeeded or the server no longer had the necessary data; \
                 either way, access is no longer permitted using that passphrase.  You should get \
                 a new passphrase.",
            ),
            Some(RespCode::PrivacyRequired) => {
                Some("The operation is not permitted due to a lack of privacy.")
            }
            Some(RespCode::ContactAdmin) => {
                Some("You should contact the system administrator or support desk.")
            }
            _ => None,
        };
        let message = match explanation {
            Some(text) => format!("{}\n\n{}", text, resp.message),
            None => format!("Login failed: {}", resp.message),
        };
        log::warn!("{}: {}", conn, message);
        model.forget_credentials();

        if model.conn_state(conn) == ConnectionState::Logout {
            model.task_failed(me, "Connection closed after a failed login");
            return Ok(());
        }
        self.ask_for_auth(model, me, conn, Some(message))
    }

    /// The consumer accepted or rejected the TLS state of the connection.
    fn decide(&mut self, model: &mut Model, me: TaskId, conn: ConnId, accept: bool) -> Result<()> {
        self.pending_ssl = None;
        if let Some(c) = model.conn_mut(conn) {
            c.suspended = false;
        }
        match model.conn_state(conn) {
            ConnectionState::SslVerifying => {
                if accept {
                    model.set_conn_state(conn, ConnectionState::ConnectedPretlsPrecaps);
                } else {
                    self.logout(
                        model,
                        me,
                        conn,
                        "The security state of the SSL connection got rejected",
                    );
                }
            }
            ConnectionState::StartTlsVerifying => {
                if accept {
                    model.set_conn_state(conn, ConnectionState::EstablishedPrecaps);
                    self.ask_for_capabilities(model, conn)?;
                } else {
                    self.logout(
                        model,
                        me,
                        conn,
                        "The security state of the connection after a STARTTLS operation got \
                         rejected",
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl ImapTask for OpenConnectionTask {
    fn perform(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        if check_abort_die(model, me) {
            return Ok(());
        }
        let conn = model.conn_of(me)?;
        model.set_conn_state(conn, ConnectionState::Connecting);
        Ok(())
    }

    fn run_ready(&mut self, model: &mut Model, me: TaskId) -> Result<()> {
        let conn = model.conn_of(me)?;
        if let Some((chain, errors)) = self.pending_ssl.clone() {
            if let Some(accept) = model.ssl_decision(&chain, &errors) {
                self.decide(model, me, conn, accept)?;
            }
        }
        if self.waiting_for_credentials && !model.core(me).finished {
            self.ask_for_auth(model, me, conn, None)?;
        }
        Ok(())
    }

    fn handle_state(&mut self, model: &mut Model, me: TaskId, resp: &StateResponse) -> Result<bool> {
        if model.core(me).dead {
            model.task_failed(me, "Asked to die");
            return Ok(true);
        }
        let conn = model.conn_of(me)?;

        let state = model.conn_state(conn);
        match state {
            ConnectionState::None
            | ConnectionState::HostLookup
            | ConnectionState::Connecting
            | ConnectionState::ConnectedPretlsPrecaps => {
                return self.handle_greeting(model, me, conn, resp)
            }
            _ if resp.tag.is_none() => return Ok(false),
            _ => {}
        }

        match state {
            ConnectionState::ConnectedPretls
            | ConnectionState::PostauthPrecaps
            | ConnectionState::EstablishedPrecaps => {
                if !completes(resp, &self.capability_cmd) {
                    return Ok(false);
                }
                if !self.check_caps(model, me, conn, resp) {
                    return Ok(true);
                }
                match state {
                    ConnectionState::ConnectedPretls => self.start_tls_or_login(model, me, conn)?,
                    ConnectionState::PostauthPrecaps => self.authenticated(model, me, conn),
                    _ => {
                        if model.has_capability(conn, "LOGINDISABLED") {
                            self.logout(
                                model,
                                me,
                                conn,
                                "Capabilities still contain LOGINDISABLED even after STARTTLS",
                            );
                        } else {
                            model.set_conn_state(conn, ConnectionState::Login);
                            self.ask_for_auth(model, me, conn, None)?;
                        }
                    }
                }
                Ok(true)
            }
            ConnectionState::StartTlsIssued => {
                if !completes(resp, &self.starttls_cmd) {
                    return Ok(false);
                }
                self.starttls_cmd = None;
                if resp.kind == StateKind::Ok {
                    if let Some(c) = model.conn_mut(conn) {
                        c.capabilities_fresh = false;
                    }
                    model.set_conn_state(conn, ConnectionState::StartTlsHandshake);
                } else {
                    let message = format!("STARTTLS failed: {}", resp.message);
                    self.logout(model, me, conn, &message);
                }
                Ok(true)
            }
            ConnectionState::SslHandshake
            | ConnectionState::SslVerifying
            | ConnectionState::StartTlsHandshake
            | ConnectionState::StartTlsVerifying => Ok(false),
            ConnectionState::Login => {
                if !completes(resp, &self.login_cmd) {
                    return Ok(false);
                }
                self.handle_login_result(model, me, conn, resp)?;
                Ok(true)
            }
            _ => Err(Error::ProtocolViolation(format!(
                "No response expected by the OpenConnectionTask in state {}",
                state
            ))),
        }
    }

    fn handle_socket_encrypted(
        &mut self,
        model: &mut Model,
        me: TaskId,
        chain: &[Vec<u8>],
        errors: &[String],
    ) -> Result<bool> {
        let conn = model.conn_of(me)?;
        let state = model.conn_state(conn);
        if state < ConnectionState::ConnectedPretlsPrecaps {
            model.set_conn_state(conn, ConnectionState::SslHandshake);
            model.set_conn_state(conn, ConnectionState::SslVerifying);
        } else if state == ConnectionState::StartTlsHandshake {
            model.set_conn_state(conn, ConnectionState::StartTlsVerifying);
        } else {
            return Ok(false);
        }
        if let Some(c) = model.conn_mut(conn) {
            c.encrypted = true;
        }

        if errors.is_empty() {
            self.decide(model, me, conn, true)?;
        } else if let Some(accept) = model.ssl_decision(chain, errors) {
            self.decide(model, me, conn, accept)?;
        } else {
            log::info!("{}: waiting for a decision about the TLS state", conn);
            self.pending_ssl = Some((chain.to_vec(), errors.to_vec()));
            if let Some(c) = model.conn_mut(conn) {
                c.suspended = true;
            }
            model.emit(Event::SslPolicyRequired {
                conn,
                chain: chain.to_vec(),
                errors: errors.to_vec(),
            });
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::MemoryCache;
    use crate::config::EngineConfig;
    use crate::model::Model;
    use crate::testing::ScriptedConnector;
    use crate::types::{ConnectionState, Event, Response, TaskState};

    fn model(connector: &ScriptedConnector, config: EngineConfig) -> Model {
        Model::new(config, MemoryCache::new(), connector.clone())
    }

    fn with_credentials() -> EngineConfig {
        EngineConfig::default().with_credentials("user", "pass")
    }

    #[test]
    fn asks_for_capabilities_then_logs_in() {
        let connector = ScriptedConnector::new().with_greeting("* OK hello\r\n");
        let mut m = model(&connector, with_credentials());
        let (conn, task) = m.open_connection().unwrap();
        m.poll();
        let h = connector.connection(0);
        assert_eq!(h.take_lines(), vec!["CAPABILITY"]);
        assert_eq!(m.connection(conn).unwrap().state(), ConnectionState::ConnectedPretls);

        h.server("* CAPABILITY IMAP4rev1\r\ny0 OK caps\r\n");
        m.poll();
        assert_eq!(h.take_lines(), vec!["LOGIN <credentials hidden>"]);
        assert_eq!(m.connection(conn).unwrap().state(), ConnectionState::Login);

        h.server("y1 OK [CAPABILITY IMAP4rev1 IDLE] logged in\r\n");
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
        assert_eq!(m.connection(conn).unwrap().state(), ConnectionState::Authenticated);
        assert!(m.connection(conn).unwrap().has_capability("IDLE"));
    }

    #[test]
    fn capabilities_after_login_are_requested_when_missing() {
        let connector =
            ScriptedConnector::new().with_greeting("* OK [CAPABILITY IMAP4rev1] hello\r\n");
        let mut m = model(&connector, with_credentials());
        let (conn, _) = m.open_connection().unwrap();
        m.poll();
        let h = connector.connection(0);
        assert_eq!(h.take_lines(), vec!["LOGIN <credentials hidden>"]);
        h.server("y0 OK logged in\r\n");
        m.poll();
        assert_eq!(h.take_lines(), vec!["CAPABILITY"]);
        assert_eq!(m.connection(conn).unwrap().state(), ConnectionState::PostauthPrecaps);
        h.server("* CAPABILITY IMAP4rev1\r\ny1 OK done\r\n");
        m.poll();
        assert_eq!(m.connection(conn).unwrap().state(), ConnectionState::Authenticated);
    }

    #[test]
    fn starttls_before_login() {
        let connector = ScriptedConnector::new()
            .with_greeting("* OK [CAPABILITY IMAP4rev1 STARTTLS LOGINDISABLED] hello\r\n")
            .with_starttls();
        let mut m = model(&connector, with_credentials());
        let (conn, task) = m.open_connection().unwrap();
        m.poll();
        let h = connector.connection(0);
        assert_eq!(h.take_lines(), vec!["STARTTLS"]);
        h.server("y0 OK go ahead\r\n");
        h.push(Response::SocketEncrypted {
            chain: Vec::new(),
            errors: Vec::new(),
        });
        m.poll();
        assert_eq!(h.take_lines(), vec!["CAPABILITY"]);
        assert_eq!(m.connection(conn).unwrap().state(), ConnectionState::EstablishedPrecaps);
        h.server("* CAPABILITY IMAP4rev1\r\ny1 OK done\r\ny2 OK [CAPABILITY IMAP4rev1] in\r\n");
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
        assert!(m.connection(conn).unwrap().is_encrypted());
    }

    #[test]
    fn preauth_is_refused_when_starttls_is_required() {
        let connector = ScriptedConnector::new()
            .with_greeting("* PREAUTH [CAPABILITY IMAP4rev1] hi\r\n")
            .with_starttls();
        let mut m = model(&connector, with_credentials());
        let (conn, task) = m.open_connection().unwrap();
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Failed));
        assert!(m.task_failure(task).unwrap().contains("PREAUTH"));
        assert!(!m.connection(conn).unwrap().is_live());
        assert_eq!(connector.connection(0).sent_lines(), vec!["LOGOUT"]);
    }

    #[test]
    fn failed_login_asks_for_new_credentials() {
        let connector =
            ScriptedConnector::new().with_greeting("* OK [CAPABILITY IMAP4rev1] hello\r\n");
        let mut m = model(&connector, with_credentials());
        let (_, task) = m.open_connection().unwrap();
        m.poll();
        let h = connector.connection(0);
        h.take_lines();
        h.server("y0 NO [AUTHENTICATIONFAILED] nope\r\n");
        m.poll();
        let asked: Vec<_> = m
            .events()
            .try_iter()
            .filter_map(|e| match e {
                Event::AuthRequested { error, .. } => Some(error),
                _ => None,
            })
            .collect();
        assert_eq!(asked.len(), 1);
        assert!(asked[0].as_ref().unwrap().starts_with("Authentication failed."));
        assert_eq!(m.task_state(task), Some(TaskState::Active));

        m.set_credentials("user", "better");
        assert_eq!(h.take_lines(), vec!["LOGIN <credentials hidden>"]);
        h.server("y1 OK [CAPABILITY IMAP4rev1] in\r\n");
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Completed));
    }

    #[test]
    fn cancelled_authentication_logs_out() {
        let connector =
            ScriptedConnector::new().with_greeting("* OK [CAPABILITY IMAP4rev1] hello\r\n");
        let mut m = model(&connector, EngineConfig::default());
        let (conn, task) = m.open_connection().unwrap();
        m.poll();
        m.cancel_authentication();
        assert_eq!(m.task_state(task), Some(TaskState::Failed));
        assert_eq!(m.task_failure(task), Some("No credentials available"));
        assert!(!m.connection(conn).unwrap().is_live());
    }

    #[test]
    fn bad_greeting_raises_an_alert() {
        let connector = ScriptedConnector::new().with_greeting("* BAD go away\r\n");
        let mut m = model(&connector, with_credentials());
        let (_, task) = m.open_connection().unwrap();
        m.poll();
        assert_eq!(m.task_state(task), Some(TaskState::Failed));
        assert!(m.events().try_iter().any(|e| matches!(
            e,
            Event::Alert { ref message, .. } if message.ends_with("go away")
        )));
    }

    #[test]
    fn certificate_problems_wait_for_the_consumer() {
        let connector = ScriptedConnector::new();
        let mut m = model(&connector, with_credentials());
        let (conn, task) = m.open_connection().unwrap();
        let h = connector.connection(0);
        let chain = vec![b"cert".to_vec()];
        let errors = vec!["self-signed".to_string()];
        h.push(Response::SocketEncrypted {
            chain: chain.clone(),
            errors: errors.clone(),
        });
        h.server("* OK [CAPABILITY IMAP4rev1] hello\r\n");
        m.poll();
        assert_eq!(m.connection(conn).unwrap().state(), ConnectionState::SslVerifying);
        assert!(h.has_pending());
        assert!(m
            .events()
            .try_iter()
            .any(|e| matches!(e, Event::SslPolicyRequired { .. })));

        m.set_ssl_policy(chain, errors, true);
        m.poll();
        assert_eq!(h.take_lines(), vec!["LOGIN <credentials hidden>"]);
        assert_eq!(m.task_state(task), Some(TaskState::Active));
    }

    #[test]
    fn queues_id_and_enable_ahead_of_other_work() {
        let connector = ScriptedConnector::new()
            .with_greeting("* PREAUTH [CAPABILITY IMAP4rev1 ID ENABLE QRESYNC] hi\r\n");
        let mut m = model(&connector, with_credentials());
        m.open_connection().unwrap();
        m.poll();
        let lines = connector.connection(0).sent_lines();
        assert!(lines[0].starts_with("ID ("));
        assert_eq!(lines[1], "ENABLE QRESYNC");
    }
}
