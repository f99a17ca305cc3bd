//! Generic segmentation offload.
//!
//! The guest may hand the driver one oversized virtual frame plus a GSO
//! descriptor; before the frame reaches the engine it is expanded into
//! wire-sized frames, each carrying a copy of the protocol headers with the
//! per-segment fields (IPv4 id/length/checksum, TCP sequence and flags)
//! rewritten.

/// Layer-4 protocol carried by a GSO frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GsoKind {
    Tcp,
    Udp,
}

/// Descriptor for a GSO super-frame.
///
/// Offsets are from the start of the Ethernet frame; `hdrs_total` covers
/// everything up to and including the L4 header, `max_seg` is the largest
/// payload chunk a single wire frame may carry.
#[derive(Debug, Clone, Copy)]
pub struct GsoDesc {
    pub kind: GsoKind,
    pub hdrs_total: usize,
    pub max_seg: usize,
    /// Offset of the IPv4 header.
    pub off_ip: usize,
    /// Offset of the TCP/UDP header.
    pub off_l4: usize,
}

const IPV4_HDR_MIN: usize = 20;
const TCP_HDR_MIN: usize = 20;
const UDP_HDR: usize = 8;

impl GsoDesc {
    /// Sanity-check the descriptor against an actual frame length.
    /// Frames with inconsistent descriptors are dropped, not segmented.
    pub fn is_valid(&self, frame_len: usize) -> bool {
        let l4_min = match self.kind {
            GsoKind::Tcp => TCP_HDR_MIN,
            GsoKind::Udp => UDP_HDR,
        };
        self.max_seg > 0
            && self.off_ip >= 14
            && self.off_ip + IPV4_HDR_MIN <= self.off_l4
            && self.off_l4 + l4_min <= self.hdrs_total
            && self.hdrs_total < frame_len
    }

    /// Number of wire frames the payload splits into.
    pub fn segment_count(&self, frame_len: usize) -> usize {
        let payload = frame_len - self.hdrs_total;
        payload.div_ceil(self.max_seg)
    }

    /// Produce segment `idx` of `count` into `out`, returning the wire
    /// frame length. `out` must hold at least `hdrs_total + max_seg` bytes.
    pub fn carve(&self, frame: &[u8], idx: usize, count: usize, out: &mut [u8]) -> usize {
        let off_payload = self.hdrs_total + idx * self.max_seg;
        let chunk = (frame.len() - off_payload).min(self.max_seg);
        let total = self.hdrs_total + chunk;

        out[..self.hdrs_total].copy_from_slice(&frame[..self.hdrs_total]);
        out[self.hdrs_total..total].copy_from_slice(&frame[off_payload..off_payload + chunk]);

        self.fixup_ipv4(out, idx, chunk);
        match self.kind {
            GsoKind::Tcp => self.fixup_tcp(out, idx, count, total),
            GsoKind::Udp => self.fixup_udp(out, chunk, total),
        }
        total
    }

    fn fixup_ipv4(&self, seg: &mut [u8], idx: usize, chunk: usize) {
        let ip = self.off_ip;
        let total_len = (self.hdrs_total - ip + chunk) as u16;
        seg[ip + 2..ip + 4].copy_from_slice(&total_len.to_be_bytes());

        let id = u16::from_be_bytes([seg[ip + 4], seg[ip + 5]]).wrapping_add(idx as u16);
        seg[ip + 4..ip + 6].copy_from_slice(&id.to_be_bytes());

        seg[ip + 10..ip + 12].copy_from_slice(&[0, 0]);
        let cksum = checksum(&seg[ip..self.off_l4]);
        seg[ip + 10..ip + 12].copy_from_slice(&cksum.to_be_bytes());
    }

    fn fixup_tcp(&self, seg: &mut [u8], idx: usize, count: usize, total: usize) {
        let l4 = self.off_l4;
        let seq = u32::from_be_bytes([seg[l4 + 4], seg[l4 + 5], seg[l4 + 6], seg[l4 + 7]])
            .wrapping_add((idx * self.max_seg) as u32);
        seg[l4 + 4..l4 + 8].copy_from_slice(&seq.to_be_bytes());

        // FIN and PSH belong to the final segment only.
        if idx + 1 < count {
            seg[l4 + 13] &= !0x09;
        }

        seg[l4 + 16..l4 + 18].copy_from_slice(&[0, 0]);
        let (src_ip, dst_ip) = self.ip_pair(seg);
        let cksum = pseudo_checksum(&src_ip, &dst_ip, 6, &seg[l4..total]);
        seg[l4 + 16..l4 + 18].copy_from_slice(&cksum.to_be_bytes());
    }

    fn fixup_udp(&self, seg: &mut [u8], chunk: usize, total: usize) {
        let l4 = self.off_l4;
        let udp_len = (UDP_HDR + chunk) as u16;
        seg[l4 + 4..l4 + 6].copy_from_slice(&udp_len.to_be_bytes());

        seg[l4 + 6..l4 + 8].copy_from_slice(&[0, 0]);
        let (src_ip, dst_ip) = self.ip_pair(seg);
        let cksum = pseudo_checksum(&src_ip, &dst_ip, 17, &seg[l4..total]);
        seg[l4 + 6..l4 + 8].copy_from_slice(&cksum.to_be_bytes());
    }

    fn ip_pair(&self, seg: &[u8]) -> ([u8; 4], [u8; 4]) {
        let ip = self.off_ip;
        let mut src = [0u8; 4];
        let mut dst = [0u8; 4];
        src.copy_from_slice(&seg[ip + 12..ip + 16]);
        dst.copy_from_slice(&seg[ip + 16..ip + 20]);
        (src, dst)
    }
}

/// Internet checksum over `data`.
pub fn checksum(data: &[u8]) -> u16 {
    finalize(sum_be_words(data))
}

/// TCP/UDP checksum including the IPv4 pseudo-header.
pub fn pseudo_checksum(src_ip: &[u8; 4], dst_ip: &[u8; 4], proto: u8, data: &[u8]) -> u16 {
    let mut sum = 0u64;
    sum += u16::from_be_bytes([src_ip[0], src_ip[1]]) as u64;
    sum += u16::from_be_bytes([src_ip[2], src_ip[3]]) as u64;
    sum += u16::from_be_bytes([dst_ip[0], dst_ip[1]]) as u64;
    sum += u16::from_be_bytes([dst_ip[2], dst_ip[3]]) as u64;
    sum += proto as u64;
    sum += data.len() as u64;
    sum += sum_be_words(data);
    finalize(sum)
}

#[inline]
fn finalize(mut sum: u64) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[inline]
fn sum_be_words(data: &[u8]) -> u64 {
    let mut sum = 0u64;
    let mut chunks = data.chunks_exact(2);
    for w in &mut chunks {
        sum += u16::from_be_bytes([w[0], w[1]]) as u64;
    }
    if let Some(&last) = chunks.remainder().first() {
        sum += u16::from_be_bytes([last, 0]) as u64;
    }
    sum
}
