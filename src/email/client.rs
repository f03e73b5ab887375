use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::error::{CoreError, CoreResult};

/// Where and how to open a mailbox.
#[derive(Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub folder: String,
    /// EXAMINE instead of SELECT.
    pub read_only: bool,
}

impl std::fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("folder", &self.folder)
            .field("read_only", &self.read_only)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMessage {
    pub uid: u32,
    pub raw: Vec<u8>,
    pub flags: Vec<String>,
}

/// An authenticated session with one folder open.
#[async_trait]
pub trait MailboxSession: Send {
    /// UIDs in ascending order.
    async fn search(&mut self, unread_only: bool) -> CoreResult<Vec<u32>>;

    /// Fetches `BODY.PEEK[]` and FLAGS; `None` when the UID is gone.
    async fn fetch(&mut self, uid: u32) -> CoreResult<Option<FetchedMessage>>;

    async fn mark_seen(&mut self, uid: u32) -> CoreResult<()>;

    async fn logout(self: Box<Self>) -> CoreResult<()>;
}

#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> CoreResult<Box<dyn MailboxSession>>;
}

#[cfg(feature = "mail")]
pub use self::imap_client::ImapConnector;

#[cfg(feature = "mail")]
mod imap_client {
    use super::*;
    use log::{debug, info};
    use std::net::TcpStream;

    type TlsSession = imap::Session<native_tls::TlsStream<TcpStream>>;

    const IMAPS_PORT: u16 = 993;

    /// IMAPS on port 993, STARTTLS on any other port.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct ImapConnector;

    impl ImapConnector {
        pub fn new() -> Self {
            Self
        }
    }

    fn open(params: ConnectParams) -> CoreResult<TlsSession> {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| CoreError::Transient(format!("Failed to create TLS connector: {e}")))?;

        let addr = (params.host.as_str(), params.port);
        let client = if params.port == IMAPS_PORT {
            imap::connect(addr, &params.host, &tls)?
        } else {
            imap::connect_starttls(addr, &params.host, &tls)?
        };

        let mut session = client
            .login(&params.username, &params.password)
            .map_err(|(e, _)| e)?;

        if params.read_only {
            session.examine(&params.folder)?;
        } else {
            session.select(&params.folder)?;
        }
        info!(
            "Opened {} on {}:{} as {}",
            params.folder, params.host, params.port, params.username
        );
        Ok(session)
    }

    #[async_trait]
    impl MailboxConnector for ImapConnector {
        async fn connect(&self, params: &ConnectParams) -> CoreResult<Box<dyn MailboxSession>> {
            let params = params.clone();
            let session = tokio::task::spawn_blocking(move || open(params)).await??;
            Ok(Box::new(ImapSession {
                inner: Arc::new(Mutex::new(session)),
            }))
        }
    }

    struct ImapSession {
        inner: Arc<Mutex<TlsSession>>,
    }

    impl ImapSession {
        async fn with_session<T, F>(&self, f: F) -> CoreResult<T>
        where
            T: Send + 'static,
            F: FnOnce(&mut TlsSession) -> CoreResult<T> + Send + 'static,
        {
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || {
                let mut session = inner
                    .lock()
                    .map_err(|_| CoreError::internal("IMAP session lock poisoned"))?;
                f(&mut session)
            })
            .await?
        }
    }

    fn flag_name(flag: &imap::types::Flag<'_>) -> String {
        use imap::types::Flag;
        match flag {
            Flag::Seen => "\\Seen".to_string(),
            Flag::Answered => "\\Answered".to_string(),
            Flag::Flagged => "\\Flagged".to_string(),
            Flag::Deleted => "\\Deleted".to_string(),
            Flag::Draft => "\\Draft".to_string(),
            Flag::Recent => "\\Recent".to_string(),
            Flag::MayCreate => "\\*".to_string(),
            Flag::Custom(name) => name.to_string(),
        }
    }

    #[async_trait]
    impl MailboxSession for ImapSession {
        async fn search(&mut self, unread_only: bool) -> CoreResult<Vec<u32>> {
            let query = if unread_only { "UNSEEN" } else { "ALL" };
            self.with_session(move |session| {
                let mut uids: Vec<u32> = session.uid_search(query)?.into_iter().collect();
                uids.sort_unstable();
                debug!("UID SEARCH {} returned {} message(s)", query, uids.len());
                Ok(uids)
            })
            .await
        }

        async fn fetch(&mut self, uid: u32) -> CoreResult<Option<FetchedMessage>> {
            self.with_session(move |session| {
                let fetches = session.uid_fetch(uid.to_string(), "(BODY.PEEK[] FLAGS)")?;
                Ok(fetches.iter().find_map(|fetch| {
                    fetch.body().map(|body| FetchedMessage {
                        uid,
                        raw: body.to_vec(),
                        flags: fetch.flags().iter().map(flag_name).collect(),
                    })
                }))
            })
            .await
        }

        async fn mark_seen(&mut self, uid: u32) -> CoreResult<()> {
            self.with_session(move |session| {
                session.uid_store(uid.to_string(), "+FLAGS (\\Seen)")?;
                Ok(())
            })
            .await
        }

        async fn logout(self: Box<Self>) -> CoreResult<()> {
            self.with_session(|session| {
                session.logout()?;
                Ok(())
            })
            .await
        }
    }
}

#[derive(Debug, Default)]
struct MemoryMailbox {
    messages: BTreeMap<u32, FetchedMessage>,
    broken: HashSet<u32>,
    refuse_connections: bool,
    connections: Vec<ConnectParams>,
    logouts: usize,
}

/// In-process mailbox for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryMailboxConnector {
    state: Arc<Mutex<MemoryMailbox>>,
}

impl MemoryMailboxConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, MemoryMailbox>> {
        self.state
            .lock()
            .map_err(|_| CoreError::internal("Memory mailbox lock poisoned"))
    }

    pub fn deliver(&self, uid: u32, raw: impl Into<Vec<u8>>) -> CoreResult<()> {
        self.lock()?.messages.insert(
            uid,
            FetchedMessage {
                uid,
                raw: raw.into(),
                flags: Vec::new(),
            },
        );
        Ok(())
    }

    /// Fetching `uid` fails until cleared.
    pub fn break_uid(&self, uid: u32, broken: bool) -> CoreResult<()> {
        let mut state = self.lock()?;
        if broken {
            state.broken.insert(uid);
        } else {
            state.broken.remove(&uid);
        }
        Ok(())
    }

    pub fn refuse_connections(&self, refuse: bool) -> CoreResult<()> {
        self.lock()?.refuse_connections = refuse;
        Ok(())
    }

    pub fn flags(&self, uid: u32) -> CoreResult<Vec<String>> {
        Ok(self
            .lock()?
            .messages
            .get(&uid)
            .map(|m| m.flags.clone())
            .unwrap_or_default())
    }

    pub fn connection_count(&self) -> CoreResult<usize> {
        Ok(self.lock()?.connections.len())
    }

    pub fn last_connection(&self) -> CoreResult<Option<ConnectParams>> {
        Ok(self.lock()?.connections.last().cloned())
    }

    pub fn logout_count(&self) -> CoreResult<usize> {
        Ok(self.lock()?.logouts)
    }
}

#[async_trait]
impl MailboxConnector for MemoryMailboxConnector {
    async fn connect(&self, params: &ConnectParams) -> CoreResult<Box<dyn MailboxSession>> {
        let mut state = self.lock()?;
        if state.refuse_connections {
            return Err(CoreError::Transient(format!(
                "Connection to {}:{} refused",
                params.host, params.port
            )));
        }
        state.connections.push(params.clone());
        Ok(Box::new(MemorySession {
            connector: self.clone(),
            read_only: params.read_only,
        }))
    }
}

struct MemorySession {
    connector: MemoryMailboxConnector,
    read_only: bool,
}

#[async_trait]
impl MailboxSession for MemorySession {
    async fn search(&mut self, unread_only: bool) -> CoreResult<Vec<u32>> {
        Ok(self
            .connector
            .lock()?
            .messages
            .values()
            .filter(|m| !unread_only || !m.flags.iter().any(|f| f == "\\Seen"))
            .map(|m| m.uid)
            .collect())
    }

    async fn fetch(&mut self, uid: u32) -> CoreResult<Option<FetchedMessage>> {
        let state = self.connector.lock()?;
        if state.broken.contains(&uid) {
            return Err(CoreError::Transient(format!("FETCH {uid} failed")));
        }
        Ok(state.messages.get(&uid).cloned())
    }

    async fn mark_seen(&mut self, uid: u32) -> CoreResult<()> {
        if self.read_only {
            return Err(CoreError::validation("Mailbox opened read-only"));
        }
        let mut state = self.connector.lock()?;
        if let Some(message) = state.messages.get_mut(&uid) {
            if !message.flags.iter().any(|f| f == "\\Seen") {
                message.flags.push("\\Seen".to_string());
            }
        }
        Ok(())
    }

    async fn logout(self: Box<Self>) -> CoreResult<()> {
        self.connector.lock()?.logouts += 1;
        Ok(())
    }
}
