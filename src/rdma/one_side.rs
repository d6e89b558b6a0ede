use std::sync::Arc;

use super::request::RequestToken;
use super::{LocalSlice, RemoteSlice};
use crate::TransResult;

// read / write / atomics complete without the target running any code
pub trait OneSideComm {
    fn post_write(
        &self,
        local: LocalSlice<'_>,
        remote: RemoteSlice<'_>,
        token: &Arc<RequestToken>,
    ) -> TransResult<()>;

    fn post_read(
        &self,
        local: LocalSlice<'_>,
        remote: RemoteSlice<'_>,
        token: &Arc<RequestToken>,
    ) -> TransResult<()>;

    /// 8-byte compare-and-swap on `remote`; the previous value lands in `local`.
    fn post_compare_swap(
        &self,
        local: LocalSlice<'_>,
        remote: RemoteSlice<'_>,
        compare: u64,
        swap: u64,
        token: &Arc<RequestToken>,
    ) -> TransResult<()>;
}
