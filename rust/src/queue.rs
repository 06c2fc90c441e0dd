//! The two object-name queues connecting the Scan Worker and the Main
//! Loop, and the messages that flow across them.

use crate::digest::ObjectName;
use crate::error::PullError;

/// Messages flowing Main Loop -> Scan Worker.
#[derive(Debug, Clone)]
pub enum ToScan {
    /// Recurse this already-staged metadata object.
    Scan(ObjectName),
    /// Quiescence request: reply with the same serial once the queue is
    /// drained and stays empty.
    MainIdle(u32),
    /// Shut the worker down.
    Quit,
}

/// Messages flowing Scan Worker -> Main Loop.
#[derive(Debug, Clone)]
pub enum ToFetch {
    /// Fetch this object from the remote.
    Fetch(ObjectName),
    /// The scan queue drained this turn.
    ScanIdle,
    /// Echo of a `MainIdle` token: the worker drained with this token
    /// still current.
    MainIdleReply(u32),
}

pub type ScanSender = async_channel::Sender<ToScan>;
pub type ScanReceiver = async_channel::Receiver<ToScan>;
pub type FetchSender = async_channel::Sender<ToFetch>;
pub type FetchReceiver = async_channel::Receiver<ToFetch>;

/// Builds the two channels connecting the loops.
pub fn channels() -> (ScanSender, ScanReceiver, FetchSender, FetchReceiver) {
    let (to_scan_tx, to_scan_rx) = async_channel::unbounded();
    let (to_fetch_tx, to_fetch_rx) = async_channel::unbounded();
    (to_scan_tx, to_scan_rx, to_fetch_tx, to_fetch_rx)
}

/// At-most-one-shot carrier for fatal errors raised off the Main Loop
/// (i.e. inside the Scan Worker thread). Bounded to 1: only the first
/// send can ever succeed before the channel fills, which is exactly the
/// "first error wins" capture policy.
pub type ErrorSender = async_channel::Sender<PullError>;
pub type ErrorReceiver = async_channel::Receiver<PullError>;

pub fn error_channel() -> (ErrorSender, ErrorReceiver) {
    async_channel::bounded(1)
}
