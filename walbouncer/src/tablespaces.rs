//! Resolution of tablespace names to oids, over a short-lived ordinary
//! connection to the primary. Side-effect free; the replication session
//! never shares this connection.

use std::collections::HashSet;

use anyhow::Context;
use postgres_ffi::Oid;
use tokio_postgres::NoTls;
use tracing::{info, warn};

/// Look up the oids of the named tablespaces (comma-separated list) on the
/// primary. Names that don't exist are logged and ignored, so a standby
/// asking for a dropped tablespace degrades to filtering it out.
pub async fn resolve_tablespace_oids(
    host: &str,
    port: u16,
    user: &str,
    names: &str,
) -> anyhow::Result<HashSet<Oid>> {
    let names: Vec<String> = names
        .split(',')
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty())
        .collect();

    let conninfo =
        format!("host={host} port={port} user={user} dbname=postgres application_name=walbouncer");
    let (client, connection) = tokio_postgres::connect(&conninfo, NoTls)
        .await
        .context("failed to connect to the primary to resolve tablespaces")?;
    // The connection object performs the actual communication with the
    // database, so spawn it off to run on its own.
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!("tablespace resolver connection error: {e}");
        }
    });

    let rows = client
        .query(
            "SELECT spcname::text, oid FROM pg_tablespace WHERE spcname = ANY($1)",
            &[&names],
        )
        .await
        .context("pg_tablespace lookup failed")?;

    let mut oids = HashSet::new();
    let mut resolved = HashSet::new();
    for row in rows {
        let name: String = row.get(0);
        let oid: Oid = row.get(1);
        info!("tablespace {} has oid {}", name, oid);
        resolved.insert(name);
        oids.insert(oid);
    }
    for name in &names {
        if !resolved.contains(name) {
            warn!("tablespace {} does not exist on the primary", name);
        }
    }

    drop(client);
    let _ = driver.await;
    Ok(oids)
}
