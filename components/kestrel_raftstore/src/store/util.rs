// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

use kestrel_proto::metapb;
use kestrel_proto::raft_cmdpb::{AdminCmdType, RaftCmdRequest};
use raft::eraftpb::{ConfState, Message, MessageType};

use crate::{Error, Result};

pub fn find_peer(region: &metapb::Region, store_id: u64) -> Option<&metapb::Peer> {
    region.peers.iter().find(|p| p.store_id == store_id)
}

pub fn remove_peer(region: &mut metapb::Region, store_id: u64) -> Option<metapb::Peer> {
    region
        .peers
        .iter()
        .position(|p| p.store_id == store_id)
        .map(|i| region.peers.remove(i))
}

pub fn new_peer(store_id: u64, peer_id: u64) -> metapb::Peer {
    metapb::Peer {
        id: peer_id,
        store_id,
    }
}

/// `epoch` is considered stale when it lags `check_epoch` in either
/// counter.
pub fn is_epoch_stale(epoch: metapb::RegionEpoch, check_epoch: metapb::RegionEpoch) -> bool {
    epoch.version < check_epoch.version || epoch.conf_ver < check_epoch.conf_ver
}

pub fn is_vote_msg(msg: &Message) -> bool {
    let t = msg.get_msg_type();
    t == MessageType::MsgRequestVote || t == MessageType::MsgRequestPreVote
}

/// The first message a fresh peer can legally receive: a vote, or a
/// heartbeat with an invalid commit (the leader probing an empty peer).
/// Anything else addressed to a nonexistent peer is dropped rather than
/// allowed to create one.
pub fn is_initial_msg(msg: &Message) -> bool {
    is_vote_msg(msg) || (msg.get_msg_type() == MessageType::MsgHeartbeat && msg.get_commit() == raft::INVALID_INDEX)
}

/// A vote from a peer that has just been initialized: its term is still
/// within one round of the bootstrap term. Only such votes are worth
/// queueing for peers that do not exist yet.
pub fn is_first_vote_msg(msg: &Message) -> bool {
    is_vote_msg(msg) && msg.get_term() == super::peer_storage::RAFT_INIT_LOG_TERM + 1
}

pub fn check_key_in_region(key: &[u8], region: &metapb::Region) -> Result<()> {
    let start = &region.start_key;
    let end = &region.end_key;
    if key >= start.as_slice() && (end.is_empty() || key < end.as_slice()) {
        Ok(())
    } else {
        Err(Error::KeyNotInRegion(key.to_vec(), region.clone()))
    }
}

pub fn check_store_id(req: &RaftCmdRequest, store_id: u64) -> Result<()> {
    let peer = req.header.peer;
    if peer.store_id == store_id {
        Ok(())
    } else {
        Err(Error::StoreNotMatch(peer.store_id, store_id))
    }
}

pub fn check_peer_id(req: &RaftCmdRequest, peer_id: u64) -> Result<()> {
    let peer = req.header.peer;
    if peer.id == peer_id {
        Ok(())
    } else {
        Err(Error::Other(
            kestrel_util::box_err!("mismatch peer id {} != {}", peer.id, peer_id),
        ))
    }
}

/// A client that lags more than one term behind gets `StaleCommand`; one
/// term behind is tolerated because the leader may have just bumped its
/// term.
pub fn check_term(req: &RaftCmdRequest, term: u64) -> Result<()> {
    let header_term = req.header.term;
    if header_term == 0 || term <= header_term + 1 {
        Ok(())
    } else {
        Err(Error::StaleCommand)
    }
}

/// Admin commands tolerate different kinds of epoch drift: log compaction
/// ignores the epoch entirely, membership changes care about `conf_ver`,
/// splits and leadership transfers about both. Plain data commands check
/// the version only, so a concurrent conf change does not fail writes.
pub fn check_region_epoch(
    req: &RaftCmdRequest,
    region: &metapb::Region,
    include_region: bool,
) -> Result<()> {
    let (check_ver, check_conf_ver) = match &req.admin_request {
        None => (true, false),
        Some(admin) => match admin.cmd_type() {
            AdminCmdType::CompactLog => (false, false),
            AdminCmdType::ChangePeer => (false, true),
            AdminCmdType::BatchSplit | AdminCmdType::TransferLeader => (true, true),
        },
    };

    if !check_ver && !check_conf_ver {
        return Ok(());
    }

    let from_epoch = req.header.region_epoch;
    let current_epoch = region.region_epoch;
    if (check_ver && from_epoch.version != current_epoch.version)
        || (check_conf_ver && from_epoch.conf_ver != current_epoch.conf_ver)
    {
        let regions = if include_region {
            vec![region.clone()]
        } else {
            vec![]
        };
        return Err(Error::EpochNotMatch(
            format!(
                "current epoch of region {} is {:?}, but you sent {:?}",
                region.id, current_epoch, from_epoch
            ),
            regions,
        ));
    }
    Ok(())
}

/// Compact display for key lists in log lines.
pub struct KeysInfoFormatter<'a, I: Iterator<Item = &'a Vec<u8>> + Clone>(pub I);

impl<'a, I: Iterator<Item = &'a Vec<u8>> + Clone> std::fmt::Display for KeysInfoFormatter<'a, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut it = self.0.clone();
        match (it.next(), it.last()) {
            (None, _) => write!(f, "(no key)"),
            (Some(only), None) => write!(f, "key {:?}", log_key(only)),
            (Some(first), Some(last)) => write!(
                f,
                "{} keys range from {:?} to {:?}",
                self.0.clone().count(),
                log_key(first),
                log_key(last)
            ),
        }
    }
}

fn log_key(key: &[u8]) -> String {
    key.iter().map(|b| format!("{:02X}", b)).collect()
}

pub fn conf_state_from_region(region: &metapb::Region) -> ConfState {
    let mut conf_state = ConfState::default();
    for p in &region.peers {
        conf_state.mut_voters().push(p.id);
    }
    conf_state
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_proto::raft_cmdpb::{
        AdminRequest, CompactLogRequest, RaftRequestHeader, TransferLeaderRequest,
    };

    fn region_with_epoch(conf_ver: u64, version: u64) -> metapb::Region {
        metapb::Region {
            id: 1,
            region_epoch: metapb::RegionEpoch { conf_ver, version },
            peers: vec![new_peer(1, 2)],
            ..Default::default()
        }
    }

    #[test]
    fn test_epoch_stale() {
        let epoch = metapb::RegionEpoch {
            conf_ver: 2,
            version: 2,
        };
        let older = metapb::RegionEpoch {
            conf_ver: 1,
            version: 2,
        };
        assert!(is_epoch_stale(older, epoch));
        assert!(!is_epoch_stale(epoch, older));
        assert!(!is_epoch_stale(epoch, epoch));
    }

    #[test]
    fn test_check_key_in_region() {
        let mut region = metapb::Region {
            start_key: b"b".to_vec(),
            end_key: b"d".to_vec(),
            ..Default::default()
        };
        check_key_in_region(b"b", &region).unwrap();
        check_key_in_region(b"c", &region).unwrap();
        check_key_in_region(b"d", &region).unwrap_err();
        check_key_in_region(b"a", &region).unwrap_err();
        region.end_key = vec![];
        check_key_in_region(b"zzz", &region).unwrap();
    }

    #[test]
    fn test_check_region_epoch_by_cmd_kind() {
        let region = region_with_epoch(2, 3);

        let mut req = RaftCmdRequest {
            header: RaftRequestHeader {
                region_id: 1,
                region_epoch: metapb::RegionEpoch {
                    conf_ver: 1,
                    version: 3,
                },
                ..Default::default()
            },
            ..Default::default()
        };

        // Normal command: version matches, conf_ver drift tolerated.
        check_region_epoch(&req, &region, false).unwrap();

        // Compact log never checks.
        req.admin_request = Some(AdminRequest::CompactLog(CompactLogRequest::default()));
        check_region_epoch(&req, &region, false).unwrap();

        // Transfer leader checks both.
        req.admin_request = Some(AdminRequest::TransferLeader(TransferLeaderRequest {
            peer: new_peer(1, 2),
        }));
        let err = check_region_epoch(&req, &region, true).unwrap_err();
        match err {
            Error::EpochNotMatch(_, regions) => assert_eq!(regions.len(), 1),
            e => panic!("unexpected error {:?}", e),
        }
    }

    #[test]
    fn test_check_term() {
        let mut req = RaftCmdRequest::default();
        check_term(&req, 10).unwrap();
        req.header.term = 9;
        check_term(&req, 10).unwrap();
        req.header.term = 5;
        assert!(matches!(check_term(&req, 10), Err(Error::StaleCommand)));
    }

    #[test]
    fn test_initial_msg() {
        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgRequestVote);
        assert!(is_initial_msg(&msg));

        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgHeartbeat);
        msg.set_commit(raft::INVALID_INDEX);
        assert!(is_initial_msg(&msg));
        msg.set_commit(5);
        assert!(!is_initial_msg(&msg));

        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgAppend);
        assert!(!is_initial_msg(&msg));
    }
}
