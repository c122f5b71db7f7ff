//! Ancillary data (`cmsg`) encoding and parsing.
//!
//! Control buffers are plain byte vectors, so headers are always read and
//! written unaligned.

use std::os::fd::RawFd;

use crate::error::{ExchangeError, Result};

const FD_SIZE: usize = std::mem::size_of::<RawFd>();

/// One ancillary data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// Originating protocol (`SOL_SOCKET` for descriptor passing).
    pub level: i32,
    /// Protocol-specific type (`SCM_RIGHTS` for descriptor passing).
    pub kind: i32,
    /// Payload without header or trailing padding.
    pub data: Vec<u8>,
}

impl ControlMessage {
    /// An `SCM_RIGHTS` block carrying `fds`.
    pub fn rights(fds: &[RawFd]) -> Self {
        Self {
            level: libc::SOL_SOCKET,
            kind: libc::SCM_RIGHTS,
            data: fds.iter().flat_map(|fd| fd.to_ne_bytes()).collect(),
        }
    }

    /// Whether this block carries descriptors.
    pub fn is_rights(&self) -> bool {
        self.level == libc::SOL_SOCKET && self.kind == libc::SCM_RIGHTS
    }

    /// Decode the descriptor numbers embedded in an `SCM_RIGHTS` block.
    ///
    /// The numbers are only meaningful (and owned by this process) when the
    /// block came out of `recvmsg`.
    pub fn descriptors(&self) -> Result<Vec<RawFd>> {
        if !self.is_rights() {
            return Err(ExchangeError::MalformedControlMessage(format!(
                "not an SCM_RIGHTS block (level {}, type {})",
                self.level, self.kind
            )));
        }
        if self.data.len() % FD_SIZE != 0 {
            return Err(ExchangeError::MalformedControlMessage(format!(
                "SCM_RIGHTS payload of {} bytes is not a whole number of descriptors",
                self.data.len()
            )));
        }

        Ok(self
            .data
            .chunks_exact(FD_SIZE)
            .map(fd_from_bytes)
            .collect())
    }

    /// Bytes this block occupies in a control buffer, padding included.
    pub fn space(&self) -> usize {
        cmsg_space(self.data.len())
    }

    /// Encode blocks into a control buffer suitable for `sendmsg`.
    pub fn encode(messages: &[ControlMessage]) -> Vec<u8> {
        let total = messages.iter().map(ControlMessage::space).sum();
        let mut buf = vec![0u8; total];
        let header_len = cmsg_len(0);

        let mut offset = 0;
        for message in messages {
            // SAFETY: cmsghdr is plain old data; all-zero is a valid value.
            let mut header: libc::cmsghdr = unsafe { std::mem::zeroed() };
            header.cmsg_level = message.level;
            header.cmsg_type = message.kind;
            header.cmsg_len = cmsg_len(message.data.len()) as _;

            // SAFETY: `offset + space` never exceeds `total`, and the header
            // fits in `cmsg_len(0)` bytes.
            unsafe {
                std::ptr::write_unaligned(
                    buf.as_mut_ptr().add(offset).cast::<libc::cmsghdr>(),
                    header,
                );
            }
            let start = offset + header_len;
            buf[start..start + message.data.len()].copy_from_slice(&message.data);
            offset += message.space();
        }

        buf
    }

    /// Parse a control buffer as returned by `recvmsg`.
    ///
    /// `buf` must be limited to the `msg_controllen` the kernel reported.
    pub fn parse(buf: &[u8]) -> Result<Vec<ControlMessage>> {
        let header_len = cmsg_len(0);
        let mut messages = Vec::new();

        let mut offset = 0;
        while offset + header_len <= buf.len() {
            // SAFETY: at least `header_len` bytes remain, which covers a full
            // cmsghdr; the read is unaligned.
            let header: libc::cmsghdr = unsafe {
                std::ptr::read_unaligned(buf.as_ptr().add(offset).cast::<libc::cmsghdr>())
            };

            let len = header.cmsg_len as usize;
            if len < header_len || offset + len > buf.len() {
                return Err(ExchangeError::MalformedControlMessage(format!(
                    "block length {len} at offset {offset} exceeds control buffer of {} bytes",
                    buf.len()
                )));
            }

            messages.push(ControlMessage {
                level: header.cmsg_level,
                kind: header.cmsg_type,
                data: buf[offset + header_len..offset + len].to_vec(),
            });
            offset += cmsg_space(len - header_len);
        }

        Ok(messages)
    }

    /// Collect every descriptor number carried by `SCM_RIGHTS` blocks in a
    /// received control buffer, even when the buffer is malformed.
    ///
    /// Whole descriptors are taken from ragged or overrunning blocks. The
    /// first structural problem is reported in [`RightsScan::problem`]
    /// instead of stopping the scan early.
    pub fn scan_rights(buf: &[u8]) -> RightsScan {
        let header_len = cmsg_len(0);
        let mut scan = RightsScan::default();

        let mut offset = 0;
        while offset + header_len <= buf.len() {
            // SAFETY: as in `parse`.
            let header: libc::cmsghdr = unsafe {
                std::ptr::read_unaligned(buf.as_ptr().add(offset).cast::<libc::cmsghdr>())
            };
            scan.blocks += 1;

            let len = header.cmsg_len as usize;
            if len < header_len {
                scan.note(format!("block length {len} at offset {offset} is shorter than a header"));
                break;
            }
            let end = (offset + len).min(buf.len());
            if end < offset + len {
                scan.note(format!(
                    "block length {len} at offset {offset} exceeds control buffer of {} bytes",
                    buf.len()
                ));
            }

            if header.cmsg_level == libc::SOL_SOCKET && header.cmsg_type == libc::SCM_RIGHTS {
                let data = &buf[offset + header_len..end];
                if data.len() % FD_SIZE != 0 {
                    scan.note(format!(
                        "SCM_RIGHTS payload of {} bytes is not a whole number of descriptors",
                        data.len()
                    ));
                }
                scan.fds.extend(data.chunks_exact(FD_SIZE).map(fd_from_bytes));
            }

            if end < offset + len {
                break;
            }
            offset += cmsg_space(len - header_len);
        }

        scan
    }
}

/// Result of [`ControlMessage::scan_rights`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RightsScan {
    /// Descriptor numbers in arrival order.
    pub fds: Vec<RawFd>,
    /// Blocks seen, rights or not.
    pub blocks: usize,
    pub problem: Option<String>,
}

impl RightsScan {
    fn note(&mut self, problem: String) {
        self.problem.get_or_insert(problem);
    }
}

fn fd_from_bytes(chunk: &[u8]) -> RawFd {
    let mut raw = [0u8; FD_SIZE];
    raw.copy_from_slice(chunk);
    RawFd::from_ne_bytes(raw)
}

/// Control buffer size needed to receive `count` descriptors in one block.
pub fn space_for_descriptors(count: usize) -> usize {
    cmsg_space(count * FD_SIZE)
}

fn cmsg_space(data_len: usize) -> usize {
    // SAFETY: CMSG_SPACE is pure arithmetic.
    unsafe { libc::CMSG_SPACE(data_len as u32) as usize }
}

fn cmsg_len(data_len: usize) -> usize {
    // SAFETY: CMSG_LEN is pure arithmetic.
    unsafe { libc::CMSG_LEN(data_len as u32) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rights_block_encodes_and_parses() {
        let buf = ControlMessage::encode(&[ControlMessage::rights(&[7])]);
        assert_eq!(buf.len(), space_for_descriptors(1));

        let messages = ControlMessage::parse(&buf).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_rights());
        assert_eq!(messages[0].descriptors().unwrap(), vec![7]);
    }

    #[test]
    fn parses_multiple_blocks() {
        let buf = ControlMessage::encode(&[
            ControlMessage::rights(&[3, 4]),
            ControlMessage::rights(&[5]),
        ]);

        let messages = ControlMessage::parse(&buf).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].descriptors().unwrap(), vec![3, 4]);
        assert_eq!(messages[1].descriptors().unwrap(), vec![5]);
    }

    #[test]
    fn empty_buffer_has_no_blocks() {
        assert!(ControlMessage::parse(&[]).unwrap().is_empty());
    }

    #[test]
    fn rejects_block_longer_than_buffer() {
        let mut buf = ControlMessage::encode(&[ControlMessage::rights(&[9])]);
        buf.truncate(cmsg_len(0) + 1);

        let err = ControlMessage::parse(&buf).unwrap_err();
        assert!(matches!(err, ExchangeError::MalformedControlMessage(_)));
    }

    #[test]
    fn non_rights_block_has_no_descriptors() {
        let message = ControlMessage {
            level: libc::SOL_SOCKET,
            kind: libc::SCM_RIGHTS + 1,
            data: vec![0; FD_SIZE],
        };
        assert!(matches!(
            message.descriptors(),
            Err(ExchangeError::MalformedControlMessage(_))
        ));
    }

    #[test]
    fn ragged_rights_payload_is_rejected() {
        let message = ControlMessage {
            level: libc::SOL_SOCKET,
            kind: libc::SCM_RIGHTS,
            data: vec![0; FD_SIZE + 1],
        };
        assert!(message.descriptors().is_err());
    }

    #[test]
    fn scan_keeps_descriptors_before_ragged_block() {
        let mut buf = ControlMessage::encode(&[ControlMessage::rights(&[11, 12])]);
        buf.extend(ControlMessage::encode(&[ControlMessage {
            level: libc::SOL_SOCKET,
            kind: libc::SCM_RIGHTS,
            data: vec![0; FD_SIZE + 1],
        }]));

        let scan = ControlMessage::scan_rights(&buf);
        assert_eq!(scan.blocks, 2);
        assert_eq!(scan.fds, vec![11, 12, 0]);
        assert!(scan.problem.unwrap().contains("whole number"));
    }

    #[test]
    fn scan_takes_whole_descriptors_from_overrunning_block() {
        let mut buf = ControlMessage::encode(&[
            ControlMessage::rights(&[4]),
            ControlMessage::rights(&[5, 6]),
        ]);
        buf.truncate(space_for_descriptors(1) + cmsg_len(FD_SIZE));

        let scan = ControlMessage::scan_rights(&buf);
        assert_eq!(scan.fds, vec![4, 5]);
        assert!(scan.problem.unwrap().contains("exceeds"));
        assert!(ControlMessage::parse(&buf).is_err());
    }

    #[test]
    fn scan_of_clean_buffer_reports_no_problem() {
        let buf = ControlMessage::encode(&[ControlMessage::rights(&[8])]);
        let scan = ControlMessage::scan_rights(&buf);
        assert_eq!(
            scan,
            RightsScan {
                fds: vec![8],
                blocks: 1,
                problem: None,
            }
        );
    }
}
