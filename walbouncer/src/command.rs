//! Parser for the small command language walsender clients speak. Commands
//! arrive as simple-protocol query strings; anything unparseable is a
//! protocol error on that command only.

use anyhow::Context;
use once_cell::sync::Lazy;
use postgres_ffi::TimeLineID;
use regex::Regex;
use utils::lsn::Lsn;

/// A parsed replication command.
#[derive(Debug, PartialEq, Eq)]
pub enum ReplicationCommand {
    IdentifySystem,
    /// START_REPLICATION [PHYSICAL] lsn [TIMELINE n]
    StartPhysical {
        startpoint: Lsn,
        timeline: Option<TimeLineID>,
    },
    /// START_REPLICATION SLOT .. LOGICAL ..
    StartLogical,
    TimelineHistory {
        timeline: TimeLineID,
    },
    BaseBackup,
    CreateReplicationSlot,
    DropReplicationSlot,
}

static START_PHYSICAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^START_REPLICATION(?:\s+PHYSICAL)?\s+([[:xdigit:]]+/[[:xdigit:]]+)(?:\s+TIMELINE\s+(\d+))?\s*$",
    )
    .unwrap()
});

static TIMELINE_HISTORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^TIMELINE_HISTORY\s+(\d+)\s*$").unwrap());

pub fn parse_command(cmd: &str) -> anyhow::Result<ReplicationCommand> {
    let cmd = cmd.trim();
    let upper = cmd.to_ascii_uppercase();

    if upper == "IDENTIFY_SYSTEM" {
        Ok(ReplicationCommand::IdentifySystem)
    } else if upper.starts_with("START_REPLICATION") {
        if upper.contains(" LOGICAL") {
            return Ok(ReplicationCommand::StartLogical);
        }
        let caps = START_PHYSICAL_RE
            .captures(cmd)
            .with_context(|| format!("invalid START_REPLICATION command: {cmd}"))?;
        let startpoint = caps[1]
            .parse::<Lsn>()
            .map_err(|e| anyhow::anyhow!("bad start LSN in {cmd}: {e:?}"))?;
        let timeline = caps
            .get(2)
            .map(|m| m.as_str().parse::<TimeLineID>())
            .transpose()
            .with_context(|| format!("bad timeline in {cmd}"))?;
        Ok(ReplicationCommand::StartPhysical {
            startpoint,
            timeline,
        })
    } else if upper.starts_with("TIMELINE_HISTORY") {
        let caps = TIMELINE_HISTORY_RE
            .captures(cmd)
            .with_context(|| format!("invalid TIMELINE_HISTORY command: {cmd}"))?;
        let timeline = caps[1]
            .parse::<TimeLineID>()
            .with_context(|| format!("bad timeline in {cmd}"))?;
        Ok(ReplicationCommand::TimelineHistory { timeline })
    } else if upper.starts_with("BASE_BACKUP") {
        Ok(ReplicationCommand::BaseBackup)
    } else if upper.starts_with("CREATE_REPLICATION_SLOT") {
        Ok(ReplicationCommand::CreateReplicationSlot)
    } else if upper.starts_with("DROP_REPLICATION_SLOT") {
        Ok(ReplicationCommand::DropReplicationSlot)
    } else {
        anyhow::bail!("unsupported command {cmd}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_identify_system() {
        assert_eq!(
            parse_command("IDENTIFY_SYSTEM").unwrap(),
            ReplicationCommand::IdentifySystem
        );
        assert_eq!(
            parse_command("identify_system").unwrap(),
            ReplicationCommand::IdentifySystem
        );
    }

    #[test]
    fn parse_start_physical() {
        assert_eq!(
            parse_command("START_REPLICATION PHYSICAL 0/1500000 TIMELINE 1").unwrap(),
            ReplicationCommand::StartPhysical {
                startpoint: Lsn(0x1500000),
                timeline: Some(1),
            }
        );
        // PHYSICAL and TIMELINE are both optional
        assert_eq!(
            parse_command("START_REPLICATION AB/CD001000").unwrap(),
            ReplicationCommand::StartPhysical {
                startpoint: Lsn(0x000000ABCD001000),
                timeline: None,
            }
        );
    }

    #[test]
    fn parse_start_logical() {
        assert_eq!(
            parse_command("START_REPLICATION SLOT myslot LOGICAL 0/0").unwrap(),
            ReplicationCommand::StartLogical
        );
    }

    #[test]
    fn parse_timeline_history() {
        assert_eq!(
            parse_command("TIMELINE_HISTORY 4").unwrap(),
            ReplicationCommand::TimelineHistory { timeline: 4 }
        );
        parse_command("TIMELINE_HISTORY").unwrap_err();
    }

    #[test]
    fn parse_slots_and_backup() {
        assert_eq!(
            parse_command("BASE_BACKUP LABEL 'x'").unwrap(),
            ReplicationCommand::BaseBackup
        );
        assert_eq!(
            parse_command("CREATE_REPLICATION_SLOT s PHYSICAL").unwrap(),
            ReplicationCommand::CreateReplicationSlot
        );
        assert_eq!(
            parse_command("DROP_REPLICATION_SLOT s").unwrap(),
            ReplicationCommand::DropReplicationSlot
        );
    }

    #[test]
    fn parse_garbage() {
        parse_command("SELECT 1").unwrap_err();
        parse_command("START_REPLICATION PHYSICAL notanlsn").unwrap_err();
        parse_command("").unwrap_err();
    }
}
