/// Injected collaborator informed after a commit publishes changed
/// table versions, so dependent generated endpoints can retarget.
/// Fire-and-forget: the store logs but never propagates notifier
/// problems.
pub trait CommitNotifier: Send + Sync {
    fn notify(&self, revision_id: &str);
}

/// Default notifier: records the publication in the log.
pub struct LogNotifier;

impl CommitNotifier for LogNotifier {
    fn notify(&self, revision_id: &str) {
        log::info!("revision {revision_id} published");
    }
}
