//! rdma_cm / ibverbs fabric.
//!
//! Endpoints are created synchronously with `rdma_create_ep` on the
//! domain's protection domain; every work request is signaled and carries
//! its `RequestToken` in `wr_id`.

use std::any::Any;
use std::ffi::{CStr, CString};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use errno::errno;
use log::{debug, warn};
use rdma_sys::*;

use super::request::RequestToken;
use super::{
    Domain, Endpoint, Link, Listener, LocalSlice, MemoryRegistration, OneSideComm, QueuePair,
    RemoteSlice, Transport, TwoSidesComm,
};
use crate::common::region::RegionMemory;
use crate::{TransError, TransResult};

const MAX_SEND_SIZE: u32 = 256;
const MAX_RECV_SIZE: u32 = 256;
const MAX_POLL: usize = 32;
// infinite RNR retries: a send waits for the peer to post a receive
const RNR_RETRY_INFINITE: u8 = 7;
const RDMA_DEPTH: u8 = 16;

fn rdma_error(what: &str) -> TransError {
    TransError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("{} failed: {}", what, errno()),
    ))
}

#[inline]
fn default_init_attr() -> ibv_qp_init_attr {
    let mut init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
    init_attr.cap.max_send_wr = MAX_SEND_SIZE;
    init_attr.cap.max_recv_wr = MAX_RECV_SIZE;
    init_attr.cap.max_send_sge = 1;
    init_attr.cap.max_recv_sge = 1;
    init_attr.cap.max_inline_data = 16;
    init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
    init_attr.sq_sig_all = 1;
    init_attr
}

fn conn_param(private: &[u8]) -> rdma_conn_param {
    let mut param = unsafe { std::mem::zeroed::<rdma_conn_param>() };
    param.private_data = private.as_ptr() as _;
    param.private_data_len = private.len() as u8;
    param.responder_resources = RDMA_DEPTH;
    param.initiator_depth = RDMA_DEPTH;
    param.retry_count = 7;
    param.rnr_retry_count = RNR_RETRY_INFINITE;
    param
}

/// Private data of the event that currently sits on `id`.
unsafe fn event_private(id: *mut rdma_cm_id) -> Vec<u8> {
    let event = (*id).event;
    if event.is_null() {
        return Vec::new();
    }
    let conn = (*event).param.conn;
    if conn.private_data.is_null() {
        return Vec::new();
    }
    std::slice::from_raw_parts(conn.private_data as *const u8, conn.private_data_len as usize).to_vec()
}

fn getaddrinfo(endpoint: &Endpoint, passive: bool) -> TransResult<*mut rdma_addrinfo> {
    let host = CString::new(endpoint.host.as_str())
        .map_err(|_| TransError::Config(format!("bad host {:?}", endpoint.host)))?;
    let port = CString::new(endpoint.port.to_string()).map_err(|_| rdma_error("port"))?;
    let mut hints = unsafe { std::mem::zeroed::<rdma_addrinfo>() };
    if passive {
        hints.ai_flags = RAI_PASSIVE as _;
    }
    hints.ai_port_space = rdma_port_space::RDMA_PS_TCP as _;
    let mut res: *mut rdma_addrinfo = std::ptr::null_mut();
    let ret = unsafe { rdma_getaddrinfo(host.as_ptr(), port.as_ptr(), &hints, &mut res) };
    if ret != 0 {
        return Err(rdma_error("rdma_getaddrinfo"));
    }
    Ok(res)
}

pub struct VerbsTransport;

impl Transport for VerbsTransport {
    fn name(&self) -> &'static str {
        "verbs"
    }

    fn open_domain(&self, device: &str) -> TransResult<Arc<dyn Domain>> {
        Ok(Arc::new(VerbsDomain::open(device)?))
    }

    fn bind(&self, endpoint: &Endpoint, domain: &Arc<dyn Domain>) -> TransResult<Box<dyn Listener>> {
        let pd = VerbsDomain::pd_of(domain)?;
        let res = getaddrinfo(endpoint, true)?;
        let mut listen_id = std::ptr::null_mut();
        let mut init_attr = default_init_attr();
        let ret = unsafe { rdma_create_ep(&mut listen_id, res, pd, &mut init_attr) };
        unsafe { rdma_freeaddrinfo(res) };
        if ret != 0 {
            return Err(rdma_error("rdma_create_ep"));
        }
        if unsafe { rdma_listen(listen_id, 10) } != 0 {
            unsafe { rdma_destroy_ep(listen_id) };
            return Err(rdma_error("rdma_listen"));
        }
        debug!("listening on {}", endpoint);
        Ok(Box::new(VerbsListener { listen_id }))
    }

    fn dial(
        &self,
        endpoint: &Endpoint,
        domain: &Arc<dyn Domain>,
        private: &[u8],
        _timeout: Duration,
    ) -> TransResult<Link> {
        let pd = VerbsDomain::pd_of(domain)?;
        let res = getaddrinfo(endpoint, false)?;
        let mut id = std::ptr::null_mut();
        let mut init_attr = default_init_attr();
        let ret = unsafe { rdma_create_ep(&mut id, res, pd, &mut init_attr) };
        unsafe { rdma_freeaddrinfo(res) };
        if ret != 0 {
            return Err(rdma_error("rdma_create_ep"));
        }

        // rdma_connect blocks until the peer accepts or rejects
        let mut param = conn_param(private);
        if unsafe { rdma_connect(id, &mut param) } != 0 {
            let e = rdma_error("rdma_connect");
            unsafe { rdma_destroy_ep(id) };
            return Err(e);
        }
        let peer_private = unsafe { event_private(id) };
        Ok(Link {
            qp: Arc::new(VerbsQp::new(id)),
            peer_private,
        })
    }
}

pub struct VerbsDomain {
    context: *mut ibv_context,
    pd: *mut ibv_pd,
}

unsafe impl Send for VerbsDomain {}
unsafe impl Sync for VerbsDomain {}

impl VerbsDomain {
    pub fn open(device: &str) -> TransResult<Self> {
        let mut num = 0;
        let list = unsafe { ibv_get_device_list(&mut num) };
        if list.is_null() {
            return Err(rdma_error("ibv_get_device_list"));
        }
        let mut context = std::ptr::null_mut();
        for i in 0..num as usize {
            let dev = unsafe { *list.add(i) };
            let name = unsafe { CStr::from_ptr(ibv_get_device_name(dev)) };
            if name.to_bytes() == device.as_bytes() {
                context = unsafe { ibv_open_device(dev) };
                break;
            }
        }
        unsafe { ibv_free_device_list(list) };
        if context.is_null() {
            return Err(TransError::Config(format!("no rdma device named {}", device)));
        }

        let pd = unsafe { ibv_alloc_pd(context) };
        if pd.is_null() {
            unsafe { ibv_close_device(context) };
            return Err(rdma_error("ibv_alloc_pd"));
        }
        Ok(Self { context, pd })
    }

    fn pd_of(domain: &Arc<dyn Domain>) -> TransResult<*mut ibv_pd> {
        domain
            .as_any()
            .downcast_ref::<VerbsDomain>()
            .map(|d| d.pd)
            .ok_or_else(|| TransError::Config("domain was not opened by the verbs fabric".into()))
    }
}

struct MrGuard(*mut ibv_mr);

unsafe impl Send for MrGuard {}
unsafe impl Sync for MrGuard {}

impl Drop for MrGuard {
    fn drop(&mut self) {
        unsafe {
            ibv_dereg_mr(self.0);
        }
    }
}

impl Domain for VerbsDomain {
    fn register(&self, memory: &Arc<RegionMemory>) -> TransResult<MemoryRegistration> {
        let access = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ.0
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0
            | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC.0;
        let mr = unsafe { ibv_reg_mr(self.pd, memory.as_ptr() as _, memory.len().max(8), access as _) };
        if mr.is_null() {
            return Err(TransError::Resource {
                bytes: memory.len(),
                reason: format!("ibv_reg_mr: {}", errno()),
            });
        }
        let (lkey, rkey) = unsafe { ((*mr).lkey, (*mr).rkey) };
        Ok(MemoryRegistration::new(lkey, rkey, Box::new(MrGuard(mr))))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VerbsDomain {
    fn drop(&mut self) {
        unsafe {
            ibv_dealloc_pd(self.pd);
            ibv_close_device(self.context);
        }
    }
}

pub struct VerbsListener {
    listen_id: *mut rdma_cm_id,
}

unsafe impl Send for VerbsListener {}

impl Listener for VerbsListener {
    fn accept(&mut self, private: &[u8], timeout: Duration) -> TransResult<Link> {
        // the synchronous listen id owns its own event channel
        let mut pfd = libc::pollfd {
            fd: unsafe { (*(*self.listen_id).channel).fd },
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
        if ready < 0 {
            return Err(rdma_error("poll"));
        }
        if ready == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no connection request").into());
        }

        let mut id = std::ptr::null_mut();
        if unsafe { rdma_get_request(self.listen_id, &mut id) } != 0 {
            return Err(rdma_error("rdma_get_request"));
        }
        let peer_private = unsafe { event_private(id) };

        let mut param = conn_param(private);
        if unsafe { rdma_accept(id, &mut param) } != 0 {
            let e = rdma_error("rdma_accept");
            unsafe { rdma_destroy_ep(id) };
            return Err(e);
        }
        Ok(Link {
            qp: Arc::new(VerbsQp::new(id)),
            peer_private,
        })
    }
}

impl Drop for VerbsListener {
    fn drop(&mut self) {
        unsafe { rdma_destroy_ep(self.listen_id) };
    }
}

pub struct VerbsQp {
    id: *mut rdma_cm_id,
    poll_lock: Mutex<()>,
}

unsafe impl Send for VerbsQp {}
unsafe impl Sync for VerbsQp {}

impl VerbsQp {
    fn new(id: *mut rdma_cm_id) -> Self {
        Self {
            id,
            poll_lock: Mutex::new(()),
        }
    }

    #[inline]
    fn sge(local: &LocalSlice<'_>) -> ibv_sge {
        ibv_sge {
            addr: local.buffer.address() + local.offset as u64,
            length: local.len as u32,
            lkey: local.buffer.local_key(),
        }
    }

    fn post(
        &self,
        opcode: std::os::raw::c_uint,
        local: &LocalSlice<'_>,
        remote: Option<&RemoteSlice<'_>>,
        atomic: Option<(u64, u64)>,
        token: &Arc<RequestToken>,
    ) -> TransResult<()> {
        token.arm(local.buffer.memory());
        if !local.in_bounds() || remote.map_or(false, |r| !r.in_bounds()) {
            token.fail("local length error".to_string());
            return Ok(());
        }

        let mut sge = Self::sge(local);
        let mut sr = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        sr.wr_id = Arc::into_raw(token.clone()) as u64;
        sr.opcode = opcode;
        sr.num_sge = 1;
        sr.next = std::ptr::null_mut();
        sr.sg_list = &mut sge as *mut _;
        sr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        if let Some(r) = remote {
            let remote_addr = r.token.address() + r.offset as u64;
            match atomic {
                Some((compare, swap)) => {
                    sr.wr.atomic.remote_addr = remote_addr;
                    sr.wr.atomic.rkey = r.token.remote_key();
                    sr.wr.atomic.compare_add = compare;
                    sr.wr.atomic.swap = swap;
                }
                None => {
                    sr.wr.rdma.remote_addr = remote_addr;
                    sr.wr.rdma.rkey = r.token.remote_key();
                }
            }
        }

        let mut bad_wr: *mut ibv_send_wr = std::ptr::null_mut();
        let ret = unsafe { ibv_post_send((*self.id).qp, &mut sr, &mut bad_wr) };
        if ret != 0 {
            // never reaches the completion queue: reclaim the reference
            drop(unsafe { Arc::from_raw(sr.wr_id as *const RequestToken) });
            token.fail(format!("ibv_post_send: {}", io::Error::from_raw_os_error(ret)));
        }
        Ok(())
    }

    fn drain(&self, cq: *mut ibv_cq) -> usize {
        let mut wcs: [ibv_wc; MAX_POLL] = unsafe { std::mem::zeroed() };
        let n = unsafe { ibv_poll_cq(cq, MAX_POLL as _, wcs.as_mut_ptr()) };
        if n < 0 {
            warn!("ibv_poll_cq returned {}", n);
            return 0;
        }
        for wc in &wcs[..n as usize] {
            let token = unsafe { Arc::from_raw(wc.wr_id as *const RequestToken) };
            if wc.status == ibv_wc_status::IBV_WC_SUCCESS {
                token.complete(wc.byte_len as usize);
            } else {
                let status = unsafe { CStr::from_ptr(ibv_wc_status_str(wc.status)) };
                token.fail(status.to_string_lossy().into_owned());
            }
        }
        n as usize
    }
}

impl OneSideComm for VerbsQp {
    fn post_write(&self, local: LocalSlice<'_>, remote: RemoteSlice<'_>, token: &Arc<RequestToken>) -> TransResult<()> {
        self.post(ibv_wr_opcode::IBV_WR_RDMA_WRITE, &local, Some(&remote), None, token)
    }

    fn post_read(&self, local: LocalSlice<'_>, remote: RemoteSlice<'_>, token: &Arc<RequestToken>) -> TransResult<()> {
        self.post(ibv_wr_opcode::IBV_WR_RDMA_READ, &local, Some(&remote), None, token)
    }

    fn post_compare_swap(
        &self,
        local: LocalSlice<'_>,
        remote: RemoteSlice<'_>,
        compare: u64,
        swap: u64,
        token: &Arc<RequestToken>,
    ) -> TransResult<()> {
        let local = LocalSlice { len: 8, ..local };
        self.post(
            ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP,
            &local,
            Some(&remote),
            Some((compare, swap)),
            token,
        )
    }
}

impl TwoSidesComm for VerbsQp {
    fn post_send(&self, local: LocalSlice<'_>, token: &Arc<RequestToken>) -> TransResult<()> {
        self.post(ibv_wr_opcode::IBV_WR_SEND, &local, None, None, token)
    }

    fn post_recv(&self, local: LocalSlice<'_>, token: &Arc<RequestToken>) -> TransResult<()> {
        token.arm(local.buffer.memory());
        if !local.in_bounds() {
            token.fail("local length error".to_string());
            return Ok(());
        }
        let mut sge = Self::sge(&local);
        let mut rr = ibv_recv_wr {
            wr_id: Arc::into_raw(token.clone()) as u64,
            next: std::ptr::null_mut(),
            sg_list: &mut sge as *mut _,
            num_sge: 1,
        };
        let mut bad_wr: *mut ibv_recv_wr = std::ptr::null_mut();
        let ret = unsafe { ibv_post_recv((*self.id).qp, &mut rr, &mut bad_wr) };
        if ret != 0 {
            drop(unsafe { Arc::from_raw(rr.wr_id as *const RequestToken) });
            token.fail(format!("ibv_post_recv: {}", io::Error::from_raw_os_error(ret)));
        }
        Ok(())
    }
}

impl QueuePair for VerbsQp {
    fn progress(&self) -> TransResult<usize> {
        let _guard = self.poll_lock.lock().unwrap();
        let (send_cq, recv_cq) = unsafe { ((*self.id).send_cq, (*self.id).recv_cq) };
        Ok(self.drain(send_cq) + self.drain(recv_cq))
    }

    fn is_connected(&self) -> bool {
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        let mut init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
        let ret = unsafe {
            ibv_query_qp(
                (*self.id).qp,
                &mut attr,
                ibv_qp_attr_mask::IBV_QP_STATE.0 as _,
                &mut init_attr,
            )
        };
        if ret != 0 {
            warn!("ibv_query_qp: {}", io::Error::from_raw_os_error(ret));
            return false;
        }
        attr.qp_state != ibv_qp_state::IBV_QPS_ERR
    }
}

impl Drop for VerbsQp {
    fn drop(&mut self) {
        unsafe {
            rdma_disconnect(self.id);
            rdma_destroy_ep(self.id);
        }
    }
}
