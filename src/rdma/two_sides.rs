use std::sync::Arc;

use super::request::RequestToken;
use super::LocalSlice;
use crate::TransResult;

// send / recv need both processes to take part
pub trait TwoSidesComm {
    fn post_send(&self, local: LocalSlice<'_>, token: &Arc<RequestToken>) -> TransResult<()>;

    /// Receives complete in the order they were posted.
    fn post_recv(&self, local: LocalSlice<'_>, token: &Arc<RequestToken>) -> TransResult<()>;
}
