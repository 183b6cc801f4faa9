//! Mapping raw member attributes to an activity classification.

use crate::model::{Activity, MemberState, Status};

/// Classifies a member from its raw attributes.
///
/// Rules apply in order: not connected is disconnected; any mute is inactive;
/// an away status (idle, invisible, offline) is inactive; anything else is
/// active.
pub const fn classify_parts(
    connected: bool,
    self_mute: bool,
    server_mute: bool,
    status: Status,
) -> Activity {
    if !connected {
        Activity::Disconnected
    } else if self_mute || server_mute || status.is_away() {
        Activity::Inactive
    } else {
        Activity::Active
    }
}

pub const fn classify(member: &MemberState) -> Activity {
    classify_parts(
        member.channel.is_some(),
        member.self_mute,
        member.server_mute,
        member.status,
    )
}
