use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{info, warn};

use super::message::{compose, ComposeError, EmailJob, EmailTemplate};
use super::{DispatchError, MailTransport, SendError};
use crate::pool::WorkerPool;
use crate::progress::{BatchHandle, SharedProgress};
use crate::userlist::Recipient;

/// Outcome of a dispatch batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    /// Roster indexes of the rows that could not be delivered.
    pub failed: Vec<usize>,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.sent + self.failed.len()
    }
}

/// Compose one message per recipient on a pool of five and send them
/// serially on the calling thread.
///
/// After every row `on_result(success, index)` is called and then the
/// progress counter is bumped. Transport failures, malformed recipient
/// addresses and missing certificates only fail their row; any other error
/// aborts the batch. `on_complete` runs once when every row has been handled.
pub fn send_certificates<T, R, C>(
    template: &EmailTemplate,
    certificates_dir: &Path,
    transport: &mut T,
    recipients: &[Recipient],
    progress: &SharedProgress,
    on_result: R,
    on_complete: C,
) -> Result<DispatchReport, DispatchError>
where
    T: MailTransport + ?Sized,
    R: FnMut(bool, usize),
    C: FnOnce(&DispatchReport),
{
    let batch = Batch {
        template,
        certificates_dir,
        recipients,
        progress,
    };
    batch.run(transport, on_result, on_complete, || {})
}

/// Borrowed inputs of one dispatch batch.
struct Batch<'a> {
    template: &'a EmailTemplate,
    certificates_dir: &'a Path,
    recipients: &'a [Recipient],
    progress: &'a SharedProgress,
}

impl Batch<'_> {
    fn run<T, R, C, D>(
        self,
        transport: &mut T,
        mut on_result: R,
        on_complete: C,
        all_submitted: D,
    ) -> Result<DispatchReport, DispatchError>
    where
        T: MailTransport + ?Sized,
        R: FnMut(bool, usize),
        C: FnOnce(&DispatchReport),
        D: FnOnce(),
    {
        let Batch {
            template,
            certificates_dir,
            recipients,
            progress,
        } = self;
        let jobs: Vec<EmailJob> = recipients
            .iter()
            .cloned()
            .map(|recipient| EmailJob::new(recipient, certificates_dir))
            .collect();

        let pool = WorkerPool::for_composing()?;
        info!("sending {} certificates", jobs.len());

        let mut report = DispatchReport::default();
        pool.map_ordered_with(
            &jobs,
            |job| job.compose(template),
            |job, composed| {
                let index = job.recipient.index;
                let success = match composed {
                    Ok(message) => match transport.send(&message) {
                        Ok(()) => true,
                        Err(err @ SendError::Transport { .. }) => {
                            warn!("could not send to {}: {err}", job.recipient.email);
                            false
                        }
                        Err(err) => return Err(DispatchError::Send(err)),
                    },
                    Err(
                        err @ (ComposeError::MissingAttachment { .. }
                        | ComposeError::InvalidRecipient { .. }),
                    ) => {
                        warn!("skipping {}: {err}", job.recipient.email);
                        false
                    }
                    Err(err) => return Err(DispatchError::Compose(err)),
                };

                if success {
                    report.sent += 1;
                } else {
                    report.failed.push(index);
                }
                on_result(success, index);
                progress.increment();
                Ok(())
            },
            all_submitted,
        )?;
        drop(pool);

        info!(
            "dispatch finished: {} sent, {} failed",
            report.sent,
            report.failed.len()
        );
        on_complete(&report);
        Ok(report)
    }
}

/// Run [`send_certificates`] on a background thread.
#[allow(clippy::too_many_arguments)]
pub fn spawn_dispatch<R, C>(
    template: EmailTemplate,
    certificates_dir: PathBuf,
    mut transport: Box<dyn MailTransport + Send>,
    recipients: Vec<Recipient>,
    progress: SharedProgress,
    on_result: R,
    on_complete: C,
) -> Result<BatchHandle<Result<DispatchReport, DispatchError>>>
where
    R: FnMut(bool, usize) + Send + 'static,
    C: FnOnce(&DispatchReport) + Send + 'static,
{
    BatchHandle::spawn(
        "dispatch-batch",
        progress,
        move |ctx| {
            let batch = Batch {
                template: &template,
                certificates_dir: &certificates_dir,
                recipients: &recipients,
                progress: ctx.progress(),
            };
            batch.run(transport.as_mut(), on_result, on_complete, || ctx.all_submitted())
        },
        None,
    )
}

/// Send one message without attachments (personal-email mode).
pub fn send_single<T>(template: &EmailTemplate, to: &str, transport: &mut T) -> Result<(), DispatchError>
where
    T: MailTransport + ?Sized,
{
    let message = compose(template, to, &[])?;
    transport.send(&message)?;
    info!("sent message to {to}");
    Ok(())
}
