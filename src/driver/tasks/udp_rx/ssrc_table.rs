use crate::id::UserId;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Bidirectional map between SSRCs and the users speaking on them.
///
/// Written by the control task, read by the receive thread on every packet.
#[derive(Debug, Default)]
pub(crate) struct SsrcTable {
    inner: RwLock<Maps>,
}

#[derive(Debug, Default)]
struct Maps {
    by_ssrc: HashMap<u32, UserId>,
    by_user: HashMap<UserId, u32>,
}

impl SsrcTable {
    /// Binds `ssrc` to `user`.
    ///
    /// Returns every binding this displaced, as `(ssrc, previous owner)`: the
    /// user's previous SSRC, and `ssrc` itself if it belonged to another user.
    pub(crate) fn bind(&self, user: UserId, ssrc: u32) -> Vec<(u32, UserId)> {
        let mut maps = self.inner.write();
        let mut displaced = Vec::new();

        if let Some(old_ssrc) = maps.by_user.insert(user, ssrc) {
            if old_ssrc != ssrc {
                maps.by_ssrc.remove(&old_ssrc);
                displaced.push((old_ssrc, user));
            }
        }

        if let Some(old_user) = maps.by_ssrc.insert(ssrc, user) {
            if old_user != user {
                maps.by_user.remove(&old_user);
                displaced.push((ssrc, old_user));
            }
        }

        displaced
    }

    /// Removes a user's binding, returning the SSRC they held.
    pub(crate) fn unbind_user(&self, user: UserId) -> Option<u32> {
        let mut maps = self.inner.write();
        let ssrc = maps.by_user.remove(&user)?;
        maps.by_ssrc.remove(&ssrc);

        Some(ssrc)
    }

    pub(crate) fn user(&self, ssrc: u32) -> Option<UserId> {
        self.inner.read().by_ssrc.get(&ssrc).copied()
    }

    #[cfg(test)]
    pub(crate) fn ssrc(&self, user: UserId) -> Option<u32> {
        self.inner.read().by_user.get(&user).copied()
    }
}
