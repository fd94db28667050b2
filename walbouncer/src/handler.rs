//! The part of a standby session that pretends to be a Postgres primary:
//! records the startup parameters, bridges the GUC report from the real
//! primary, and dispatches replication commands.

use anyhow::anyhow;
use postgres_backend::{Handler, PostgresBackend, QueryError};
use postgres_ffi::TimeLineID;
use pq_proto::{BeMessage, FeStartupPacket, RowDescriptor, INT4_OID, TEXT_OID};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;
use utils::lsn::Lsn;

use crate::command::{parse_command, ReplicationCommand};
use crate::master::MasterConnection;
use crate::send_wal;
use crate::tablespaces;
use crate::WalBouncerConf;

/// Server settings the client libraries expect to hear about; read through
/// from the primary, in this order.
const REPORTED_GUCS: &[&str] = &[
    "server_version",
    "server_encoding",
    "client_encoding",
    "application_name",
    "is_superuser",
    "session_authorization",
    "DateStyle",
    "IntervalStyle",
    "TimeZone",
    "integer_datetimes",
    "standard_conforming_strings",
];

/// Values of the `replication` startup parameter that select walsender
/// mode. Everything else is refused.
const WALSENDER_VALUES: &[&str] = &["true", "on", "yes", "1", "database"];

pub struct WalProxyHandler {
    conf: WalBouncerConf,
    /// Connection to the primary, opened right after authentication.
    master: Option<MasterConnection>,
    pub user_name: Option<String>,
    pub database_name: Option<String>,
    /// The application_name startup parameter doubles as the
    /// comma-separated list of tablespaces to include.
    pub include_tablespaces: Option<String>,
    pub cmdline_options: Option<String>,
    /// Remaining startup parameters, kept verbatim.
    pub guc_options: Vec<(String, String)>,
}

impl WalProxyHandler {
    pub fn new(conf: WalBouncerConf) -> WalProxyHandler {
        WalProxyHandler {
            conf,
            master: None,
            user_name: None,
            database_name: None,
            include_tablespaces: None,
            cmdline_options: None,
            guc_options: Vec::new(),
        }
    }

    async fn handle_identify_system<IO: AsyncRead + AsyncWrite + Unpin + Send>(
        &mut self,
        pgb: &mut PostgresBackend<IO>,
    ) -> Result<(), QueryError> {
        let master = self.master.as_mut().expect("master connection not open");
        let identity = master.identify_system().await?;
        info!(
            "primary identifies as system {} timeline {} at {}",
            identity.systemid, identity.timeline, identity.xlogpos
        );

        let timeline = identity.timeline.to_string();
        let xlogpos = identity.xlogpos.to_string();
        pgb.write_message_noflush(&BeMessage::RowDescription(&[
            RowDescriptor {
                name: b"systemid",
                typoid: TEXT_OID,
                typlen: -1,
                ..Default::default()
            },
            RowDescriptor {
                name: b"timeline",
                typoid: INT4_OID,
                typlen: 4,
                ..Default::default()
            },
            RowDescriptor {
                name: b"xlogpos",
                typoid: TEXT_OID,
                typlen: -1,
                ..Default::default()
            },
            RowDescriptor {
                name: b"dbname",
                typoid: TEXT_OID,
                typlen: -1,
                ..Default::default()
            },
        ]))?
        .write_message_noflush(&BeMessage::DataRow(&[
            Some(identity.systemid.as_bytes()),
            Some(timeline.as_bytes()),
            Some(xlogpos.as_bytes()),
            identity.dbname.as_deref().map(|s| s.as_bytes()),
        ]))?
        .write_message_noflush(&BeMessage::CommandComplete(b"SELECT"))?;
        Ok(())
    }

    async fn handle_start_replication<IO: AsyncRead + AsyncWrite + Unpin + Send>(
        &mut self,
        pgb: &mut PostgresBackend<IO>,
        startpoint: Lsn,
        timeline: Option<TimeLineID>,
    ) -> Result<(), QueryError> {
        let include = match &self.include_tablespaces {
            Some(list) => {
                info!("including tablespaces: {}", list);
                let user = self.user_name.as_deref().expect("user checked at startup");
                Some(
                    tablespaces::resolve_tablespace_oids(
                        &self.conf.master_host,
                        self.conf.master_port,
                        user,
                        list,
                    )
                    .await?,
                )
            }
            None => None,
        };

        let master = self.master.as_mut().expect("master connection not open");
        send_wal::handle_start_replication(pgb, master, startpoint, timeline, include).await
    }
}

#[async_trait::async_trait]
impl<IO: AsyncRead + AsyncWrite + Unpin + Send> Handler<IO> for WalProxyHandler {
    fn startup(
        &mut self,
        _pgb: &mut PostgresBackend<IO>,
        sm: &FeStartupPacket,
    ) -> Result<(), QueryError> {
        let FeStartupPacket::StartupMessage { params, .. } = sm else {
            return Err(QueryError::Other(anyhow!(
                "unexpected startup packet: {sm}"
            )));
        };

        let mut am_walsender = false;
        for (name, value) in params.iter() {
            match name {
                "database" => self.database_name = Some(value.to_owned()),
                "user" => self.user_name = Some(value.to_owned()),
                "options" => self.cmdline_options = Some(value.to_owned()),
                "application_name" => self.include_tablespaces = Some(value.to_owned()),
                "replication" => {
                    if WALSENDER_VALUES
                        .iter()
                        .any(|v| v.eq_ignore_ascii_case(value))
                    {
                        am_walsender = true;
                    } else {
                        return Err(QueryError::Other(anyhow!(
                            "invalid value for parameter \"replication\": {value}"
                        )));
                    }
                }
                _ => self
                    .guc_options
                    .push((name.to_owned(), value.to_owned())),
            }
        }

        if !am_walsender {
            return Err(QueryError::Other(anyhow!(
                "this is a WAL proxy that only accepts replication connections"
            )));
        }
        if self.user_name.as_deref().unwrap_or("").is_empty() {
            return Err(QueryError::Other(anyhow!(
                "no PostgreSQL user name specified in startup packet"
            )));
        }

        info!(
            "standby startup: user {:?} application_name {:?}",
            self.user_name, self.include_tablespaces
        );
        Ok(())
    }

    async fn greet(&mut self, pgb: &mut PostgresBackend<IO>) -> Result<(), QueryError> {
        let user = self.user_name.as_deref().expect("user checked at startup");
        let master =
            MasterConnection::connect(&self.conf.master_host, self.conf.master_port, user).await?;

        for name in REPORTED_GUCS {
            if let Some(value) = master.parameter_status(name) {
                pgb.write_message_noflush(&BeMessage::ParameterStatus {
                    name: name.as_bytes(),
                    value: value.as_bytes(),
                })?;
            }
        }
        // We have no backend to cancel.
        pgb.write_message_noflush(&BeMessage::BackendKeyData {
            pid: 0,
            cancel_key: 0,
        })?;

        self.master = Some(master);
        Ok(())
    }

    async fn process_query(
        &mut self,
        pgb: &mut PostgresBackend<IO>,
        query_string: &str,
    ) -> Result<(), QueryError> {
        let cmd = parse_command(query_string)?;
        info!("got query {:?}", query_string);

        match cmd {
            ReplicationCommand::IdentifySystem => self.handle_identify_system(pgb).await,
            ReplicationCommand::StartPhysical {
                startpoint,
                timeline,
            } => {
                self.handle_start_replication(pgb, startpoint, timeline)
                    .await
            }
            ReplicationCommand::StartLogical => Err(QueryError::Other(anyhow!(
                "logical replication is not supported"
            ))),
            ReplicationCommand::TimelineHistory { .. } => Err(QueryError::Other(anyhow!(
                "TIMELINE_HISTORY is not supported"
            ))),
            ReplicationCommand::BaseBackup => Err(QueryError::Other(anyhow!(
                "BASE_BACKUP is not supported"
            ))),
            ReplicationCommand::CreateReplicationSlot
            | ReplicationCommand::DropReplicationSlot => Err(QueryError::Other(anyhow!(
                "replication slots are not supported"
            ))),
        }
    }
}
