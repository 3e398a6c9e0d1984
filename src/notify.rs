//! Notification boundary
//!
//! Update passes report quarantined files and persistence failures through
//! this interface. Real delivery (email, chat, ...) lives outside the
//! engine.

/// Receives operational notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, subject: &str, body: &str);
}

/// Default notifier: writes to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, subject: &str, body: &str) {
        log::warn!("{}: {}", subject, body);
    }
}
