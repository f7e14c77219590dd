//! Outbound response reporting
//!
//! The deployer never talks to the downstream L2/L3 consumer directly; it
//! reports through this notifier, which wraps the outbound one-slot
//! mailbox. A newer event overwrites an unconsumed one, matching the
//! inbound side's last-write-wins discipline.

use std::collections::HashSet;

use tracing::debug;

use crate::mailbox::Mailbox;
use crate::types::{Member, Response};

/// Reports delivery outcomes to the downstream consumer
#[derive(Clone, Default)]
pub struct Notifier {
    outbound: Mailbox<Response>,
}

impl Notifier {
    /// Wrap the given outbound mailbox
    pub fn new(outbound: Mailbox<Response>) -> Self {
        Self { outbound }
    }

    /// Request forwarding-database records for the given members
    ///
    /// Sent before the actual device POST so the records exist by the
    /// time traffic could arrive.
    pub fn send_fdb_records(&self, members: HashSet<Member>) {
        debug!(members = members.len(), "requesting forwarding-database records");
        self.outbound.send(Response {
            admitted: false,
            fdb_requested: true,
            members,
        });
    }

    /// Report that the device admitted the configuration
    ///
    /// Sent only after an accepted delivery; carries the member set so
    /// the consumer can program ARP/admission state.
    pub fn send_admission(&self, members: HashSet<Member>) {
        debug!(members = members.len(), "reporting admitted configuration");
        self.outbound.send(Response {
            admitted: true,
            fdb_requested: false,
            members,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(address: &str, port: u16) -> Member {
        Member {
            address: address.into(),
            port,
        }
    }

    #[tokio::test]
    async fn fdb_request_is_not_an_admission() {
        let outbound = Mailbox::new();
        let notifier = Notifier::new(outbound.clone());

        notifier.send_fdb_records([member("10.0.0.1", 80)].into_iter().collect());

        let response = outbound.recv().await.unwrap();
        assert!(response.fdb_requested);
        assert!(!response.admitted);
        assert!(response.members.contains(&member("10.0.0.1", 80)));
    }

    #[tokio::test]
    async fn admission_supersedes_an_unconsumed_fdb_request() {
        let outbound = Mailbox::new();
        let notifier = Notifier::new(outbound.clone());

        notifier.send_fdb_records([member("10.0.0.1", 80)].into_iter().collect());
        notifier.send_admission([member("10.0.0.1", 80)].into_iter().collect());

        // Last write wins on the one-slot mailbox
        let response = outbound.recv().await.unwrap();
        assert!(response.admitted);
        assert!(outbound.try_recv().is_none());
    }
}
