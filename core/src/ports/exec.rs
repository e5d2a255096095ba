//! Container exec port (interface).

use crate::error::Result;

/// Port for running one-shot commands inside a container.
pub trait ExecClient: Send + Sync + 'static {
    /// Run `command` in `container` of `pod` and return its stdout lines.
    ///
    /// A non-zero exit status is an error.
    fn execute_command(
        &self,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;
}
