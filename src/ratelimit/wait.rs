//! Caller-side helpers that wait out [`Admission::Wait`] results.
//!
//! The coordinator never sleeps. These loops are one way to wait: an async
//! one on the tokio timer and a blocking one on the current thread. Giving
//! up before a slot is granted records nothing.

use std::time::{Duration, Instant};

use tracing::debug;

use super::backend::AdmissionControl;
use super::tracker::Admission;
use crate::error::{Result, RiftgateError};

/// Wait asynchronously until `endpoint` is admitted.
///
/// With a `deadline`, gives up with [`RiftgateError::AdmissionTimeout`] as
/// soon as the next required wait would overrun it.
pub async fn acquire_async<A>(control: &A, endpoint: &str, deadline: Option<Duration>) -> Result<()>
where
    A: AdmissionControl + ?Sized,
{
    let started = Instant::now();
    loop {
        match control.acquire(endpoint) {
            Admission::Granted => return Ok(()),
            Admission::Wait(wait) => {
                check_deadline(endpoint, started, wait, deadline)?;
                debug!(endpoint = endpoint, wait = ?wait, "Waiting for admission");
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// Block the current thread until `endpoint` is admitted.
pub fn acquire_blocking<A>(control: &A, endpoint: &str, deadline: Option<Duration>) -> Result<()>
where
    A: AdmissionControl + ?Sized,
{
    let started = Instant::now();
    loop {
        match control.acquire(endpoint) {
            Admission::Granted => return Ok(()),
            Admission::Wait(wait) => {
                check_deadline(endpoint, started, wait, deadline)?;
                debug!(endpoint = endpoint, wait = ?wait, "Blocking for admission");
                std::thread::sleep(wait);
            }
        }
    }
}

fn check_deadline(
    endpoint: &str,
    started: Instant,
    wait: Duration,
    deadline: Option<Duration>,
) -> Result<()> {
    let Some(deadline) = deadline else {
        return Ok(());
    };
    let waited = started.elapsed();
    if waited + wait > deadline {
        return Err(RiftgateError::AdmissionTimeout {
            scope: endpoint.to_string(),
            waited,
        });
    }
    Ok(())
}
