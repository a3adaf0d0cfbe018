//! Minimal generic-netlink consumer for the thermal event stream
//!
//! Resolves the thermal family and its event multicast group through
//! `nlctrl`, joins the group, and decodes `CPU_CAPABILITY_CHANGE` messages
//! into [`CpuCapability`] tuples. Attribute parsing is kept in pure functions
//! over byte slices so it can be exercised without a kernel.
//!
//! Netlink speaks host byte order; all (de)serialization here uses native
//! endianness on purpose.

use std::os::fd::RawFd;
use std::time::Duration;

use spd_error::{DaemonError, Result};
use tracing::{debug, warn};

use crate::constants::netlink as cfg;
use crate::monitor::{CapabilityStream, CpuCapability};

// Wire-format constants not exported by libc
const GENL_ID_CTRL: u16 = 0x10;
const NLM_F_REQUEST: u16 = 0x01;
const NLMSG_ERROR: u16 = 0x02;
const NLMSG_DONE: u16 = 0x03;

const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_ATTR_FAMILY_ID: u16 = 1;
const CTRL_ATTR_FAMILY_NAME: u16 = 2;
const CTRL_ATTR_MCAST_GROUPS: u16 = 7;
const CTRL_ATTR_MCAST_GRP_NAME: u16 = 1;
const CTRL_ATTR_MCAST_GRP_ID: u16 = 2;

const NLMSG_HDR_LEN: usize = 16;
const GENL_HDR_LEN: usize = 4;
const NLA_HDR_LEN: usize = 4;
const NLA_TYPE_MASK: u16 = 0x3fff;

const RECV_BUF_LEN: usize = 8192;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn get_u16(buf: &[u8]) -> Option<u16> {
    Some(u16::from_ne_bytes(buf.get(..2)?.try_into().ok()?))
}

fn get_u32(buf: &[u8]) -> Option<u32> {
    Some(u32::from_ne_bytes(buf.get(..4)?.try_into().ok()?))
}

/// One attribute: `(type, payload)` with the nested/byte-order flags masked
/// off the type.
struct NlAttr<'a> {
    ty: u16,
    payload: &'a [u8],
}

/// Iterate a packed attribute list, stopping at the first malformed header.
fn attributes(mut buf: &[u8]) -> Vec<NlAttr<'_>> {
    let mut attrs = Vec::new();
    while buf.len() >= NLA_HDR_LEN {
        let Some(len) = get_u16(buf).map(usize::from) else {
            break;
        };
        let Some(ty) = get_u16(&buf[2..]) else {
            break;
        };
        if len < NLA_HDR_LEN || len > buf.len() {
            break;
        }
        attrs.push(NlAttr { ty: ty & NLA_TYPE_MASK, payload: &buf[NLA_HDR_LEN..len] });
        let advance = align4(len).min(buf.len());
        buf = &buf[advance..];
    }
    attrs
}

/// Decode the flat nested attribute list of a capability event.
///
/// The list is a sequence of u32 payloads whose logical tuple size is three:
/// cpu, scaled perf, scaled eff. perf/eff are right-shifted to restore the
/// [0, 255] range.
fn parse_capabilities(nested: &[u8]) -> Vec<CpuCapability> {
    let mut out = Vec::new();
    let mut tuple = [0u32; 3];
    let mut index = 0usize;
    for attr in attributes(nested) {
        let Some(value) = get_u32(attr.payload) else {
            continue;
        };
        tuple[index] = value;
        index += 1;
        if index == 3 {
            out.push(CpuCapability {
                cpu: tuple[0],
                perf: tuple[1] >> cfg::CAPABILITY_SCALE_SHIFT,
                eff: tuple[2] >> cfg::CAPABILITY_SCALE_SHIFT,
            });
            index = 0;
        }
    }
    out
}

/// Pull capability tuples out of one received datagram.
///
/// Non-capability commands are logged and skipped; a datagram with nothing of
/// interest yields an empty vec.
fn extract_capabilities(mut buf: &[u8]) -> Vec<CpuCapability> {
    let mut out = Vec::new();
    while buf.len() >= NLMSG_HDR_LEN {
        let Some(msg_len) = get_u32(buf).map(|l| l as usize) else {
            break;
        };
        let Some(msg_type) = get_u16(&buf[4..]) else {
            break;
        };
        if msg_len < NLMSG_HDR_LEN || msg_len > buf.len() {
            break;
        }
        let payload = &buf[NLMSG_HDR_LEN..msg_len];

        match msg_type {
            NLMSG_ERROR | NLMSG_DONE => {}
            _ if payload.len() >= GENL_HDR_LEN => {
                let cmd = payload[0];
                if cmd == cfg::CPU_CAPABILITY_CHANGE {
                    for attr in attributes(&payload[GENL_HDR_LEN..]) {
                        if attr.ty == cfg::ATTR_CPU_CAPABILITY {
                            out.extend(parse_capabilities(attr.payload));
                        }
                    }
                } else {
                    debug!("Ignoring thermal event command {:#x}", cmd);
                }
            }
            _ => {}
        }

        let advance = align4(msg_len).min(buf.len());
        buf = &buf[advance..];
    }
    out
}

/// Parse the nlctrl GETFAMILY reply into `(family_id, multicast_group_id)`.
fn parse_family_reply(buf: &[u8], group_name: &str) -> Result<(u16, u32)> {
    if buf.len() < NLMSG_HDR_LEN + GENL_HDR_LEN {
        return Err(DaemonError::NetlinkMessage("short GETFAMILY reply".into()));
    }
    let msg_type = get_u16(&buf[4..])
        .ok_or_else(|| DaemonError::NetlinkMessage("short GETFAMILY reply".into()))?;
    if msg_type == NLMSG_ERROR {
        let errno = buf
            .get(NLMSG_HDR_LEN..NLMSG_HDR_LEN + 4)
            .and_then(get_u32)
            .map(|v| -(v as i32))
            .unwrap_or(0);
        return Err(DaemonError::NetlinkResolve {
            family: cfg::THERMAL_FAMILY.into(),
            reason: format!("kernel replied with error {}", errno),
        });
    }

    let msg_len = get_u32(buf).map(|l| l as usize).unwrap_or(0).min(buf.len());
    if msg_len < NLMSG_HDR_LEN + GENL_HDR_LEN {
        return Err(DaemonError::NetlinkMessage("short GETFAMILY reply".into()));
    }
    let mut family_id = None;
    let mut group_id = None;

    for attr in attributes(&buf[NLMSG_HDR_LEN + GENL_HDR_LEN..msg_len]) {
        match attr.ty {
            CTRL_ATTR_FAMILY_ID => family_id = get_u16(attr.payload),
            CTRL_ATTR_MCAST_GROUPS => {
                for group in attributes(attr.payload) {
                    let mut name_matches = false;
                    let mut id = None;
                    for field in attributes(group.payload) {
                        match field.ty {
                            CTRL_ATTR_MCAST_GRP_NAME => {
                                let name = field
                                    .payload
                                    .split(|&b| b == 0)
                                    .next()
                                    .unwrap_or(&[]);
                                name_matches = name == group_name.as_bytes();
                            }
                            CTRL_ATTR_MCAST_GRP_ID => id = get_u32(field.payload),
                            _ => {}
                        }
                    }
                    if name_matches {
                        group_id = id;
                    }
                }
            }
            _ => {}
        }
    }

    match (family_id, group_id) {
        (Some(family), Some(group)) => Ok((family, group)),
        (None, _) => Err(DaemonError::NetlinkResolve {
            family: cfg::THERMAL_FAMILY.into(),
            reason: "family id missing from reply".into(),
        }),
        (_, None) => Err(DaemonError::NetlinkResolve {
            family: cfg::THERMAL_FAMILY.into(),
            reason: format!("multicast group '{}' not advertised", group_name),
        }),
    }
}

/// Serialize a GETFAMILY request for the given family name.
fn family_request(seq: u32, family: &str) -> Vec<u8> {
    let name_len = family.len() + 1; // trailing NUL
    let nla_len = NLA_HDR_LEN + name_len;
    let total = NLMSG_HDR_LEN + GENL_HDR_LEN + align4(nla_len);

    let mut msg = Vec::with_capacity(total);
    // nlmsghdr
    msg.extend_from_slice(&(total as u32).to_ne_bytes());
    msg.extend_from_slice(&GENL_ID_CTRL.to_ne_bytes());
    msg.extend_from_slice(&NLM_F_REQUEST.to_ne_bytes());
    msg.extend_from_slice(&seq.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes()); // pid: kernel assigns
    // genlmsghdr
    msg.push(CTRL_CMD_GETFAMILY);
    msg.push(1); // version
    msg.extend_from_slice(&0u16.to_ne_bytes());
    // CTRL_ATTR_FAMILY_NAME
    msg.extend_from_slice(&(nla_len as u16).to_ne_bytes());
    msg.extend_from_slice(&CTRL_ATTR_FAMILY_NAME.to_ne_bytes());
    msg.extend_from_slice(family.as_bytes());
    msg.push(0);
    msg.resize(total, 0);
    msg
}

/// Connected, subscribed generic-netlink socket for thermal events
pub struct ThermalGenlSocket {
    fd: RawFd,
    buf: Vec<u8>,
}

impl ThermalGenlSocket {
    /// Open, resolve the thermal family, and join the event group.
    pub fn open() -> Result<Self> {
        // SAFETY: plain socket(2) call; the fd is owned by the returned value
        // and closed in Drop.
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_GENERIC,
            )
        };
        if fd < 0 {
            return Err(DaemonError::NetlinkSocket(std::io::Error::last_os_error()));
        }
        let mut socket = Self { fd, buf: vec![0u8; RECV_BUF_LEN] };

        socket.bind()?;
        socket.set_recv_timeout(Duration::from_secs(cfg::RECV_TIMEOUT_SECS as u64))?;

        let (_, group) =
            socket.resolve(cfg::THERMAL_FAMILY, cfg::THERMAL_EVENT_GROUP)?;
        socket.join_group(group)?;
        debug!(
            "Subscribed to {}/{} (group id {})",
            cfg::THERMAL_FAMILY,
            cfg::THERMAL_EVENT_GROUP,
            group
        );
        Ok(socket)
    }

    fn bind(&self) -> Result<()> {
        // SAFETY: sockaddr_nl is zero-initialized and fully set before use.
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        // SAFETY: addr is a valid sockaddr_nl for the lifetime of the call.
        let rc = unsafe {
            libc::bind(
                self.fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(DaemonError::NetlinkSocket(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn set_recv_timeout(&self, timeout: Duration) -> Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        // SAFETY: tv is a valid timeval for the duration of the call.
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(DaemonError::NetlinkSocket(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn join_group(&self, group: u32) -> Result<()> {
        // SAFETY: group is a valid u32 for the duration of the call.
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_NETLINK,
                libc::NETLINK_ADD_MEMBERSHIP,
                &group as *const u32 as *const libc::c_void,
                std::mem::size_of::<u32>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(DaemonError::NetlinkSocket(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn send_to_kernel(&self, msg: &[u8]) -> Result<()> {
        // SAFETY: dest is a valid sockaddr_nl addressing the kernel (pid 0).
        let mut dest: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        dest.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        // SAFETY: msg is valid for msg.len() bytes; dest outlives the call.
        let rc = unsafe {
            libc::sendto(
                self.fd,
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
                &dest as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(DaemonError::NetlinkSocket(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Blocking receive honoring the socket timeout; `Ok(None)` on timeout.
    fn recv(&mut self) -> Result<Option<usize>> {
        // SAFETY: buf is valid for buf.len() bytes for the duration of the
        // call.
        let rc = unsafe {
            libc::recv(
                self.fd,
                self.buf.as_mut_ptr() as *mut libc::c_void,
                self.buf.len(),
                0,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => Ok(None),
                _ => Err(DaemonError::NetlinkSocket(err)),
            };
        }
        Ok(Some(rc as usize))
    }

    fn resolve(&mut self, family: &str, group_name: &str) -> Result<(u16, u32)> {
        self.send_to_kernel(&family_request(1, family))?;
        match self.recv()? {
            Some(len) => parse_family_reply(&self.buf[..len], group_name),
            None => Err(DaemonError::NetlinkResolve {
                family: family.into(),
                reason: "no reply from nlctrl".into(),
            }),
        }
    }
}

impl CapabilityStream for ThermalGenlSocket {
    fn next_capabilities(&mut self) -> Result<Option<Vec<CpuCapability>>> {
        let Some(len) = self.recv()? else {
            return Ok(None);
        };
        if len == self.buf.len() {
            warn!("Netlink datagram filled the receive buffer; events may be truncated");
        }
        let capabilities = extract_capabilities(&self.buf[..len]);
        if capabilities.is_empty() {
            Ok(None)
        } else {
            Ok(Some(capabilities))
        }
    }
}

impl Drop for ThermalGenlSocket {
    fn drop(&mut self) {
        // SAFETY: fd is owned by this value and closed exactly once.
        unsafe {
            libc::close(self.fd);
        }
    }
}
