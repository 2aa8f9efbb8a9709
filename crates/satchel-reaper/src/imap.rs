//! Remote deletion over IMAP, built on `async-imap`.
//!
//! Production sessions run over TLS. [`ImapSession`] itself is generic over
//! the stream so it can be driven over any transport.

use std::fmt;

use async_native_tls::TlsStream;
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::TryStreamExt;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

use satchel_shared::UserId;

use crate::config::ImapSettings;
use crate::error::MailboxError;
use crate::mailbox::{MailboxConnector, MailboxSession};

pub type TlsImapStream = TlsStream<Compat<TcpStream>>;

/// Connects every user to the single account configured for the deployment.
pub struct ImapConnector {
    settings: ImapSettings,
}

impl ImapConnector {
    pub fn new(settings: ImapSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    fn account(&self, _user: UserId) -> String {
        format!(
            "{}@{}:{}",
            self.settings.username, self.settings.host, self.settings.port
        )
    }

    async fn connect(&self, user: UserId) -> Result<Box<dyn MailboxSession>, MailboxError> {
        let host = self.settings.host.as_str();
        info!(host, port = self.settings.port, user_id = %user, "connecting to IMAP server");

        let tcp = TcpStream::connect((host, self.settings.port)).await?;
        let tls = async_native_tls::TlsConnector::new()
            .connect(host, tcp.compat())
            .await?;
        let session = ImapSession::login(tls, &self.settings.username, &self.settings.password).await?;
        Ok(Box::new(session))
    }
}

/// An authenticated session plus the folder it has selected.
pub struct ImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    session: async_imap::Session<T>,
    selected: Option<String>,
    /// `UID EXPUNGE` is only available with the UIDPLUS extension.
    uidplus: bool,
}

impl<T> ImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    pub async fn login(stream: T, username: &str, password: &str) -> Result<Self, MailboxError> {
        let client = async_imap::Client::new(stream);
        let mut session = client
            .login(username, password)
            .await
            .map_err(|(e, _)| MailboxError::from(e))?;

        let uidplus = session.capabilities().await?.has_str("UIDPLUS");
        debug!(uidplus, "IMAP session authenticated");
        Ok(Self {
            session,
            selected: None,
            uidplus,
        })
    }

    async fn select(&mut self, folder: &str) -> Result<(), MailboxError> {
        if self.selected.as_deref() == Some(folder) {
            return Ok(());
        }
        self.selected = None;
        self.session.select(folder).await?;
        self.selected = Some(folder.to_string());
        Ok(())
    }
}

#[async_trait]
impl<T> MailboxSession for ImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    async fn delete_message(&mut self, folder: &str, uid: u32) -> Result<(), MailboxError> {
        self.select(folder).await?;
        let uid_set = uid.to_string();

        self.session
            .uid_store(&uid_set, "+FLAGS.SILENT (\\Deleted)")
            .await?
            .try_collect::<Vec<_>>()
            .await?;

        if !self.uidplus {
            // A plain EXPUNGE would also remove every other \Deleted message
            // in the folder. The flag stays set for the next client expunge.
            warn!(folder, uid, "server lacks UIDPLUS, message flagged but not expunged");
            return Ok(());
        }

        self.session
            .uid_expunge(&uid_set)
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        debug!(folder, uid, "remote message expunged");
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), MailboxError> {
        self.session.logout().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    struct Script {
        capabilities: &'static str,
        refuse_login: bool,
    }

    /// Scripted single-connection server. Records every command it receives,
    /// tag stripped.
    async fn fake_server(script: Script) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = tokio::io::split(stream);
            let mut lines = BufReader::new(reader).lines();
            writer.write_all(b"* OK IMAP4rev1 ready\r\n").await.unwrap();

            while let Ok(Some(line)) = lines.next_line().await {
                let (tag, command) = line.split_once(' ').unwrap();
                log.lock().unwrap().push(command.to_string());

                let reply = if command.starts_with("LOGIN") && script.refuse_login {
                    format!("{tag} NO [AUTHENTICATIONFAILED] invalid credentials\r\n")
                } else if command.starts_with("CAPABILITY") {
                    format!("* CAPABILITY {}\r\n{tag} OK done\r\n", script.capabilities)
                } else if command.starts_with("SELECT") {
                    format!(
                        "* FLAGS (\\Seen \\Deleted)\r\n* 3 EXISTS\r\n* 0 RECENT\r\n\
                         * OK [UIDVALIDITY 7] ok\r\n{tag} OK [READ-WRITE] done\r\n"
                    )
                } else if command.starts_with("UID EXPUNGE") {
                    format!("* 3 EXPUNGE\r\n{tag} OK done\r\n")
                } else if command.starts_with("LOGOUT") {
                    format!("* BYE closing\r\n{tag} OK done\r\n")
                } else {
                    format!("{tag} OK done\r\n")
                };
                writer.write_all(reply.as_bytes()).await.unwrap();
                if command.starts_with("LOGOUT") {
                    break;
                }
            }
        });

        (addr, seen)
    }

    async fn session_at(addr: SocketAddr) -> Result<ImapSession<Compat<TcpStream>>, MailboxError> {
        let tcp = TcpStream::connect(addr).await.unwrap();
        ImapSession::login(tcp.compat(), "bulk", "p\"w").await
    }

    fn position(seen: &[String], prefix: &str) -> usize {
        seen.iter()
            .position(|c| c.starts_with(prefix))
            .unwrap_or_else(|| panic!("no {prefix:?} in {seen:?}"))
    }

    #[tokio::test]
    async fn test_delete_selects_once_and_expunges_by_uid() {
        let (addr, seen) = fake_server(Script {
            capabilities: "IMAP4rev1 UIDPLUS",
            refuse_login: false,
        })
        .await;
        let mut session = session_at(addr).await.unwrap();

        session.delete_message("INBOX", 42).await.unwrap();
        session.delete_message("INBOX", 43).await.unwrap();
        session.logout().await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.iter().filter(|c| c.starts_with("SELECT")).count(), 1);
        assert!(position(&seen, "LOGIN") < position(&seen, "SELECT"));
        assert!(position(&seen, "SELECT") < position(&seen, "UID STORE 42 "));
        assert!(position(&seen, "UID STORE 42 ") < position(&seen, "UID EXPUNGE 42"));
        assert!(position(&seen, "UID EXPUNGE 42") < position(&seen, "UID STORE 43 "));
        assert!(position(&seen, "UID STORE 43 ") < position(&seen, "UID EXPUNGE 43"));
        assert!(seen[position(&seen, "UID STORE 42 ")].ends_with("+FLAGS.SILENT (\\Deleted)"));
        assert_eq!(seen.last().map(String::as_str), Some("LOGOUT"));
        assert!(!seen.iter().any(|c| c == "EXPUNGE"));
    }

    #[tokio::test]
    async fn test_without_uidplus_never_expunges_the_folder() {
        let (addr, seen) = fake_server(Script {
            capabilities: "IMAP4rev1",
            refuse_login: false,
        })
        .await;
        let mut session = session_at(addr).await.unwrap();

        session.delete_message("Sent", 7).await.unwrap();
        session.logout().await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert!(seen.iter().any(|c| c.starts_with("UID STORE 7 ")));
        assert!(!seen.iter().any(|c| c.contains("EXPUNGE")));
    }

    #[tokio::test]
    async fn test_rejected_login_is_an_error() {
        let (addr, _seen) = fake_server(Script {
            capabilities: "IMAP4rev1",
            refuse_login: true,
        })
        .await;
        assert!(matches!(session_at(addr).await, Err(MailboxError::Imap(_))));
    }

    #[test]
    fn test_all_users_share_one_account() {
        let connector = ImapConnector::new(ImapSettings {
            host: "mail.internal".into(),
            port: 993,
            username: "bulk".into(),
            password: "secret".into(),
        });
        assert_eq!(connector.account(UserId(1)), connector.account(UserId(2)));
        assert!(!connector.account(UserId(1)).contains("secret"));
    }
}
