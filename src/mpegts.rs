//! Minimal MPEG transport stream support: a muxer for the SRT egress and
//! a demuxer for the SRT ingest bridge. Only the surface the relay needs
//! (one H.264 video stream, one ADTS AAC audio stream).

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

pub const TS_PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;

pub const PAT_PID: u16 = 0x0000;
pub const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x0100;
pub const AUDIO_PID: u16 = 0x0101;

pub const STREAM_TYPE_H264: u8 = 0x1B;
pub const STREAM_TYPE_AAC_ADTS: u8 = 0x0F;

const VIDEO_STREAM_ID: u8 = 0xE0;
const AUDIO_STREAM_ID: u8 = 0xC0;

fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &b in data {
        crc ^= (b as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

// ---------------------------------------------------------------- muxer

/// Packs H.264 (Annex-B) and AAC (ADTS) frames into 188-byte transport
/// cells. Tables are re-emitted ahead of every keyframe so late joiners
/// can lock on.
pub struct TsMuxer {
    pat_cc: u8,
    pmt_cc: u8,
    video_cc: u8,
    audio_cc: u8,
    tables_written: bool,
}

impl TsMuxer {
    pub fn new() -> Self {
        Self {
            pat_cc: 0,
            pmt_cc: 0,
            video_cc: 0,
            audio_cc: 0,
            tables_written: false,
        }
    }

    pub fn write_tables(&mut self, out: &mut BytesMut) {
        let pat = build_pat();
        let pmt = build_pmt();
        let pat_cc = &mut self.pat_cc;
        write_section(out, PAT_PID, pat_cc, &pat);
        let pmt_cc = &mut self.pmt_cc;
        write_section(out, PMT_PID, pmt_cc, &pmt);
        self.tables_written = true;
    }

    /// One H.264 access unit in Annex-B form. `pts`/`dts` are 90 kHz.
    pub fn write_video(
        &mut self,
        out: &mut BytesMut,
        pts: u64,
        dts: u64,
        keyframe: bool,
        annexb: &[u8],
    ) {
        if keyframe || !self.tables_written {
            self.write_tables(out);
        }
        let pes = build_pes(VIDEO_STREAM_ID, pts, Some(dts), annexb);
        let cc = &mut self.video_cc;
        write_pes_cells(out, VIDEO_PID, cc, keyframe, Some(dts), &pes);
    }

    /// One ADTS AAC frame. `pts` is 90 kHz.
    pub fn write_audio(&mut self, out: &mut BytesMut, pts: u64, adts: &[u8]) {
        if !self.tables_written {
            self.write_tables(out);
        }
        let pes = build_pes(AUDIO_STREAM_ID, pts, None, adts);
        let cc = &mut self.audio_cc;
        write_pes_cells(out, AUDIO_PID, cc, false, None, &pes);
    }
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

fn build_pat() -> Vec<u8> {
    let mut section = vec![
        0x00, // table_id
        0x00, 0x00, // section_syntax + length, patched below
        0x00, 0x01, // transport_stream_id
        0xC1, // version 0, current_next 1
        0x00, // section_number
        0x00, // last_section_number
        0x00, 0x01, // program_number 1
        0xE0 | ((PMT_PID >> 8) as u8), // reserved + PMT PID hi
        PMT_PID as u8,
    ];
    patch_section_length(&mut section);
    append_crc(&mut section);
    section
}

fn build_pmt() -> Vec<u8> {
    let mut section = vec![
        0x02, // table_id
        0x00, 0x00, // section_syntax + length, patched below
        0x00, 0x01, // program_number
        0xC1, // version 0, current_next 1
        0x00, // section_number
        0x00, // last_section_number
        0xE0 | ((VIDEO_PID >> 8) as u8), // PCR PID = video
        VIDEO_PID as u8,
        0xF0, 0x00, // program_info_length 0
    ];
    for (stream_type, pid) in [
        (STREAM_TYPE_H264, VIDEO_PID),
        (STREAM_TYPE_AAC_ADTS, AUDIO_PID),
    ] {
        section.push(stream_type);
        section.push(0xE0 | ((pid >> 8) as u8));
        section.push(pid as u8);
        section.push(0xF0);
        section.push(0x00); // ES_info_length 0
    }
    patch_section_length(&mut section);
    append_crc(&mut section);
    section
}

fn patch_section_length(section: &mut [u8]) {
    // everything after the length field, plus the CRC still to come
    let len = (section.len() - 3 + 4) as u16;
    section[1] = 0xB0 | ((len >> 8) as u8 & 0x0F);
    section[2] = len as u8;
}

fn append_crc(section: &mut Vec<u8>) {
    let crc = crc32_mpeg2(section);
    section.extend_from_slice(&crc.to_be_bytes());
}

fn write_section(out: &mut BytesMut, pid: u16, cc: &mut u8, section: &[u8]) {
    // pointer_field ahead of the section
    let mut payload = Vec::with_capacity(section.len() + 1);
    payload.push(0);
    payload.extend_from_slice(section);
    write_pes_cells(out, pid, cc, false, None, &payload);
}

fn build_pes(stream_id: u8, pts: u64, dts: Option<u64>, payload: &[u8]) -> Vec<u8> {
    let header_data_len: u8 = if dts.is_some() { 10 } else { 5 };
    let mut pes = Vec::with_capacity(9 + header_data_len as usize + payload.len());
    pes.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);

    let body_len = 3 + header_data_len as usize + payload.len();
    // video PES length is left unbounded, audio carries the real length
    let len_field: u16 = if stream_id == VIDEO_STREAM_ID || body_len > 0xFFFF {
        0
    } else {
        body_len as u16
    };
    pes.push((len_field >> 8) as u8);
    pes.push(len_field as u8);

    pes.push(0x80); // marker bits, no scrambling
    pes.push(if dts.is_some() { 0xC0 } else { 0x80 });
    pes.push(header_data_len);

    write_pts_field(&mut pes, if dts.is_some() { 0x30 } else { 0x20 }, pts);
    if let Some(dts) = dts {
        write_pts_field(&mut pes, 0x10, dts);
    }
    pes.extend_from_slice(payload);
    pes
}

fn write_pts_field(out: &mut Vec<u8>, prefix: u8, ts: u64) {
    let ts = ts & ((1 << 33) - 1);
    out.push(prefix | ((((ts >> 30) & 0x07) as u8) << 1) | 1);
    out.push(((ts >> 22) & 0xFF) as u8);
    out.push(((((ts >> 15) & 0x7F) as u8) << 1) | 1);
    out.push(((ts >> 7) & 0xFF) as u8);
    out.push((((ts & 0x7F) as u8) << 1) | 1);
}

fn write_pes_cells(
    out: &mut BytesMut,
    pid: u16,
    cc: &mut u8,
    random_access: bool,
    pcr: Option<u64>,
    data: &[u8],
) {
    let mut offset = 0usize;
    let mut first = true;

    while offset < data.len() {
        let mut cell = [0xFFu8; TS_PACKET_SIZE];
        cell[0] = SYNC_BYTE;
        cell[1] = (((pid >> 8) as u8) & 0x1F) | if first { 0x40 } else { 0x00 };
        cell[2] = pid as u8;

        let want_af = first && (random_access || pcr.is_some());
        let min_af_body = if want_af {
            1 + if pcr.is_some() { 6 } else { 0 }
        } else {
            0
        };
        let min_af_total = if min_af_body > 0 { min_af_body + 1 } else { 0 };

        let space = 184 - min_af_total;
        let take = (data.len() - offset).min(space);
        let af_total = 184 - take;

        if af_total > 0 {
            cell[3] = 0x30 | *cc;
            cell[4] = (af_total - 1) as u8;
            if af_total > 1 {
                let mut flags = 0u8;
                if first && random_access {
                    flags |= 0x40;
                }
                let mut pos = 6;
                if first {
                    if let Some(base) = pcr {
                        flags |= 0x10;
                        let base = base & ((1 << 33) - 1);
                        cell[6] = (base >> 25) as u8;
                        cell[7] = (base >> 17) as u8;
                        cell[8] = (base >> 9) as u8;
                        cell[9] = (base >> 1) as u8;
                        cell[10] = (((base & 1) as u8) << 7) | 0x7E;
                        cell[11] = 0x00;
                        pos = 12;
                    }
                }
                cell[5] = flags;
                // remaining adaptation bytes up to the payload are stuffing
                for b in cell.iter_mut().take(4 + af_total).skip(pos) {
                    *b = 0xFF;
                }
            }
        } else {
            cell[3] = 0x10 | *cc;
        }

        cell[4 + af_total..].copy_from_slice(&data[offset..offset + take]);
        out.extend_from_slice(&cell);

        *cc = (*cc + 1) & 0x0F;
        offset += take;
        first = false;
    }
}

// -------------------------------------------------------------- demuxer

/// Elementary-stream packet recovered from the transport stream.
#[derive(Debug, Clone)]
pub struct PesPacket {
    pub pid: u16,
    /// Stream type from the PMT, if one was seen for this PID.
    pub stream_type: Option<u8>,
    /// 33-bit PTS at 90 kHz.
    pub pts: Option<u64>,
    pub data: Bytes,
}

#[derive(Default)]
struct PesAccumulator {
    data: Vec<u8>,
}

/// Incremental TS demuxer: feed arbitrary byte chunks, collect complete
/// PES packets. Sync loss is recovered by scanning for the next aligned
/// sync byte.
pub struct TsDemuxer {
    buf: BytesMut,
    pmt_pid: Option<u16>,
    stream_types: HashMap<u16, u8>,
    pes: HashMap<u16, PesAccumulator>,
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            pmt_pid: None,
            stream_types: HashMap::new(),
            pes: HashMap::new(),
        }
    }

    pub fn stream_type(&self, pid: u16) -> Option<u8> {
        self.stream_types.get(&pid).copied()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<PesPacket> {
        self.buf.extend_from_slice(chunk);
        let mut packets = Vec::new();

        loop {
            // resync: drop garbage until a sync byte leads the buffer
            while !self.buf.is_empty() && self.buf[0] != SYNC_BYTE {
                let skip = self
                    .buf
                    .iter()
                    .position(|&b| b == SYNC_BYTE)
                    .unwrap_or(self.buf.len());
                let _ = self.buf.split_to(skip);
            }
            if self.buf.len() < TS_PACKET_SIZE {
                break;
            }

            let cell = self.buf.split_to(TS_PACKET_SIZE);
            self.parse_cell(&cell, &mut packets);
        }

        packets
    }

    /// Emits whatever is still accumulating, on stream end.
    pub fn flush(&mut self) -> Vec<PesPacket> {
        let mut packets = Vec::new();
        let pids: Vec<u16> = self.pes.keys().copied().collect();
        for pid in pids {
            self.finish_pes(pid, &mut packets);
        }
        packets
    }

    fn parse_cell(&mut self, cell: &[u8], packets: &mut Vec<PesPacket>) {
        let pusi = cell[1] & 0x40 != 0;
        let pid = (((cell[1] & 0x1F) as u16) << 8) | cell[2] as u16;
        let afc = (cell[3] >> 4) & 0x03;

        let mut offset = 4;
        if afc == 0x02 || afc == 0x03 {
            let af_len = cell[4] as usize;
            offset += 1 + af_len;
        }
        if afc == 0x02 || offset >= cell.len() {
            return;
        }
        let payload = &cell[offset..];

        if pid == PAT_PID {
            self.parse_pat(payload, pusi);
        } else if Some(pid) == self.pmt_pid {
            self.parse_pmt(payload, pusi);
        } else {
            if pusi {
                self.finish_pes(pid, packets);
            }
            self.pes
                .entry(pid)
                .or_default()
                .data
                .extend_from_slice(payload);
        }
    }

    fn parse_pat(&mut self, payload: &[u8], pusi: bool) {
        let section = match psi_section(payload, pusi) {
            Some(s) => s,
            None => return,
        };
        if section.first() != Some(&0x00) || section.len() < 13 {
            return;
        }
        let section_length = (((section[1] & 0x0F) as usize) << 8) | section[2] as usize;
        let entries_end = (3 + section_length).saturating_sub(4).min(section.len());
        let mut pos = 8;
        while pos + 4 <= entries_end {
            let program = ((section[pos] as u16) << 8) | section[pos + 1] as u16;
            let pid = (((section[pos + 2] & 0x1F) as u16) << 8) | section[pos + 3] as u16;
            if program != 0 {
                self.pmt_pid = Some(pid);
                return;
            }
            pos += 4;
        }
    }

    fn parse_pmt(&mut self, payload: &[u8], pusi: bool) {
        let section = match psi_section(payload, pusi) {
            Some(s) => s,
            None => return,
        };
        if section.first() != Some(&0x02) || section.len() < 16 {
            return;
        }
        let section_length = (((section[1] & 0x0F) as usize) << 8) | section[2] as usize;
        let entries_end = (3 + section_length).saturating_sub(4).min(section.len());

        let program_info_len = (((section[10] & 0x0F) as usize) << 8) | section[11] as usize;
        let mut pos = 12 + program_info_len;
        while pos + 5 <= entries_end {
            let stream_type = section[pos];
            let pid = (((section[pos + 1] & 0x1F) as u16) << 8) | section[pos + 2] as u16;
            let es_info_len = (((section[pos + 3] & 0x0F) as usize) << 8) | section[pos + 4] as usize;
            self.stream_types.insert(pid, stream_type);
            pos += 5 + es_info_len;
        }
    }

    fn finish_pes(&mut self, pid: u16, packets: &mut Vec<PesPacket>) {
        let acc = match self.pes.remove(&pid) {
            Some(acc) if !acc.data.is_empty() => acc,
            _ => return,
        };
        if let Some((pts, data)) = parse_pes(&acc.data) {
            packets.push(PesPacket {
                pid,
                stream_type: self.stream_types.get(&pid).copied(),
                pts,
                data,
            });
        }
    }
}

impl Default for TsDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

fn psi_section(payload: &[u8], pusi: bool) -> Option<&[u8]> {
    if !pusi || payload.is_empty() {
        return None;
    }
    let pointer = payload[0] as usize;
    payload.get(1 + pointer..)
}

fn parse_pes(data: &[u8]) -> Option<(Option<u64>, Bytes)> {
    if data.len() < 9 || data[0] != 0 || data[1] != 0 || data[2] != 1 {
        return None;
    }
    let flags = data[7];
    let header_data_len = data[8] as usize;
    let payload_start = 9 + header_data_len;
    if data.len() < payload_start {
        return None;
    }

    let pts = if flags & 0x80 != 0 && header_data_len >= 5 {
        Some(read_pts_field(&data[9..14]))
    } else {
        None
    };

    Some((pts, Bytes::copy_from_slice(&data[payload_start..])))
}

fn read_pts_field(b: &[u8]) -> u64 {
    (((b[0] >> 1) & 0x07) as u64) << 30
        | (b[1] as u64) << 22
        | (((b[2] >> 1) & 0x7F) as u64) << 15
        | (b[3] as u64) << 7
        | ((b[4] >> 1) & 0x7F) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annexb_keyframe() -> Vec<u8> {
        let mut v = vec![0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1F];
        v.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE]);
        v.extend_from_slice(&[0, 0, 0, 1, 0x65]);
        v.extend(std::iter::repeat(0xAB).take(400));
        v
    }

    #[test]
    fn mux_produces_aligned_cells() {
        let mut muxer = TsMuxer::new();
        let mut out = BytesMut::new();
        muxer.write_video(&mut out, 90_000, 90_000, true, &annexb_keyframe());

        assert!(out.len() >= TS_PACKET_SIZE);
        assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        for cell in out.chunks(TS_PACKET_SIZE) {
            assert_eq!(cell[0], SYNC_BYTE);
        }
        // tables lead the stream
        let first_pid = (((out[1] & 0x1F) as u16) << 8) | out[2] as u16;
        assert_eq!(first_pid, PAT_PID);
    }

    #[test]
    fn demux_recovers_pts_and_stream_types() {
        let mut muxer = TsMuxer::new();
        let mut out = BytesMut::new();
        muxer.write_video(&mut out, 90_000, 90_000, true, &annexb_keyframe());
        muxer.write_audio(&mut out, 91_000, &[0xFF, 0xF1, 0x50, 0x80, 0x01, 0x3F, 0xFC, 0x01]);
        // a second access unit closes out the first PES packets
        muxer.write_video(&mut out, 93_000, 93_000, false, &[0, 0, 0, 1, 0x41, 0x9A]);

        let mut demuxer = TsDemuxer::new();
        let mut packets = demuxer.push(&out);
        packets.extend(demuxer.flush());

        let video: Vec<_> = packets.iter().filter(|p| p.pid == VIDEO_PID).collect();
        let audio: Vec<_> = packets.iter().filter(|p| p.pid == AUDIO_PID).collect();
        assert_eq!(video.len(), 2);
        assert_eq!(audio.len(), 1);
        assert_eq!(video[0].pts, Some(90_000));
        assert_eq!(video[0].stream_type, Some(STREAM_TYPE_H264));
        assert_eq!(audio[0].pts, Some(91_000));
        assert_eq!(audio[0].stream_type, Some(STREAM_TYPE_AAC_ADTS));
        assert!(video[0].data.windows(5).any(|w| w == [0, 0, 0, 1, 0x65]));
    }

    #[test]
    fn demux_survives_fragmented_input() {
        let mut muxer = TsMuxer::new();
        let mut out = BytesMut::new();
        muxer.write_video(&mut out, 180_000, 180_000, true, &annexb_keyframe());
        muxer.write_video(&mut out, 183_000, 183_000, false, &[0, 0, 0, 1, 0x41, 0x9A]);

        let mut demuxer = TsDemuxer::new();
        let mut packets = Vec::new();
        for chunk in out.chunks(61) {
            packets.extend(demuxer.push(chunk));
        }
        packets.extend(demuxer.flush());

        let video: Vec<_> = packets.iter().filter(|p| p.pid == VIDEO_PID).collect();
        assert_eq!(video.len(), 2);
        assert_eq!(video[0].pts, Some(180_000));
    }

    #[test]
    fn demux_resyncs_after_garbage() {
        let mut muxer = TsMuxer::new();
        let mut out = BytesMut::new();
        muxer.write_video(&mut out, 90_000, 90_000, true, &annexb_keyframe());
        muxer.write_video(&mut out, 93_000, 93_000, false, &[0, 0, 0, 1, 0x41, 0x9A]);

        let mut corrupted = vec![0xDEu8, 0xAD, 0xBE];
        corrupted.extend_from_slice(&out);

        let mut demuxer = TsDemuxer::new();
        let mut packets = demuxer.push(&corrupted);
        packets.extend(demuxer.flush());
        assert!(packets.iter().any(|p| p.pid == VIDEO_PID));
    }

    #[test]
    fn psi_crc_is_mpeg2() {
        // known-good check: CRC of an empty slice is the initial value
        assert_eq!(crc32_mpeg2(&[]), 0xFFFF_FFFF);
        // and the function must be deterministic over table rebuilds
        assert_eq!(crc32_mpeg2(&build_pat()[..build_pat().len() - 4]),
                   u32::from_be_bytes(build_pat()[build_pat().len() - 4..].try_into().unwrap()));
    }
}
