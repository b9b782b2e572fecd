// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the device driver consuming dispatched requests.

use std::sync::Arc;

use strum::IntoStaticStr;

use crate::request::Request;
use crate::HctxId;

/// Outcome of handing a request to [Driver::submit]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoStaticStr)]
pub enum SubmitResult {
    /// The device took ownership of the request, and will complete it later
    Accepted,
    /// The device cannot take the request right now; it will be retried
    Busy,
    /// The device failed the request outright
    Error,
}

/// Verdict of [Driver::timeout] on an expired request
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoStaticStr)]
pub enum TimeoutAction {
    /// The driver dealt with the request: finalize it now, reporting the
    /// status recorded through [Request::set_status] (success if none was)
    Handled,
    /// Give the request another full timeout period
    ResetTimer,
    /// Leave the request with the driver until a device reset
    NotHandled,
}

/// Device driver receiving requests from the hardware queues of a
/// [crate::RequestQueue].
pub trait Driver: Send + Sync + 'static {
    /// Issue `rq` on hardware queue `hctx`.
    ///
    /// `last` is set when no further request is queued behind this one in the
    /// current dispatch batch, allowing the driver to ring its doorbell.  Must
    /// not block unless the queue was configured as blocking.
    fn submit(&self, hctx: HctxId, rq: &Arc<Request>, last: bool)
        -> SubmitResult;

    /// A started request has passed its deadline
    fn timeout(&self, _rq: &Arc<Request>) -> TimeoutAction {
        TimeoutAction::ResetTimer
    }

    /// Reserve device-level admission budget ahead of a submission.
    ///
    /// Budget obtained for a request which is then accepted by
    /// [Driver::submit] belongs to the driver, which returns it through
    /// [Driver::put_budget] when it sees fit (usually upon completion).
    fn get_budget(&self, _hctx: HctxId) -> bool {
        true
    }

    /// Return admission budget
    fn put_budget(&self, _hctx: HctxId) {}
}
