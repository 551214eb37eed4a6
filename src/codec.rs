//! Packet codec: raw capture files to per-channel sample artifacts.
//!
//! One chassis records its 32 channels as a stream of UDP datagrams dumped to
//! one or more `.dat` files. This module reconstructs contiguous fixed-rate
//! sample streams from that loss-prone capture: it stream-parses packet
//! envelopes across the file list (in order, as one logical stream), decodes
//! the 24-bit interleaved samples, detects sequence-number gaps and fills
//! them with flat-hold placeholders so every channel keeps identical length,
//! and writes one `.j` artifact per channel.
//!
//! # Wire format
//!
//! Envelope, big-endian: 2-byte magic `"PS"`, 2-byte kind code (`0x4e42`
//! block carries limit markers, `0x4e41` it does not), 4-byte body length,
//! two 4-byte reserved fields. Body: 4-byte reserved, 4-byte reserved
//! (`0xffffffff`), 8-byte monotonic sequence number, 4-byte block marker,
//! 4-byte reserved, optional 4x4-byte limit fields, then up to 448 samples:
//! 14 groups of 32 interleaved channels, each a big-endian signed 24-bit
//! integer. The reserved/marker fields are opaque; nothing downstream has
//! been shown to need them.
//!
//! # Diagnostics are data
//!
//! Loss and malformation never abort an invocation. A sequence gap of `k`
//! blocks yields one `Missing k [a, b)` entry and `k` x 14 synthesized groups;
//! a corrupt or truncated envelope aborts the *current file* only; an
//! out-of-order block is skipped without advancing state. A chassis with zero
//! decodable blocks still emits 32 empty, well-formed artifacts.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Buf;
use tracing::debug;

use crate::error::EngineResult;

/// Channels per chassis; every block interleaves all of them.
pub const CHANNELS: usize = 32;
/// Sample groups per block, also the synthesis unit for a missing block.
pub const GROUPS_PER_BLOCK: u64 = 14;

const MAGIC: u16 = 0x5053; // "PS"
const KIND_WITH_LIMITS: u16 = 0x4e42; // "NB"
const KIND_NO_LIMITS: u16 = 0x4e41; // "NA"

const ENVELOPE_LEN: usize = 16;
const BLOCK_PREFIX_LEN: usize = 24;
const LIMITS_LEN: usize = 16;
const GROUP_LEN: usize = 3 * CHANNELS;
/// Upper bound on a plausible body; anything larger is disk corruption.
const MAX_BODY_LEN: usize = 1 << 24;
/// Largest sequence gap still treated as network loss. A well-framed block
/// whose sequence number jumps further than this (a flipped high bit, say)
/// would drive unbounded synthesis; it is skipped as malformed instead.
pub const MAX_GAP_BLOCKS: u64 = 1 << 16;

const ARTIFACT_VERSION: u32 = 1;
const ARTIFACT_HEADER_LEN: u64 = 20;

/// Result of decoding one chassis's capture.
#[derive(Debug)]
pub struct DecodeOutput {
    /// Real plus synthesized samples written to every channel artifact.
    pub samples_per_channel: u64,
    /// Human-readable loss/malformation entries; empty means a clean decode.
    pub diagnostics: Vec<String>,
}

/// Artifact file name for a zero-based channel index, e.g. `CH07.j`.
pub fn channel_artifact_name(channel_index: usize) -> String {
    format!("CH{channel_index:02}.j")
}

/// Decode one chassis's capture files (concatenated in list order) into 32
/// channel artifacts under `outdir`.
///
/// Hard I/O faults (unreadable input, unwritable output) are errors; decode
/// problems are diagnostics in the returned [`DecodeOutput`].
pub fn convert_capture(inputs: &[PathBuf], outdir: &Path) -> EngineResult<DecodeOutput> {
    let mut decoder = Decoder::create(outdir)?;
    for input in inputs {
        decoder.decode_file(input)?;
    }
    decoder.finish()
}

struct Decoder {
    writers: Vec<ChannelWriter>,
    last_seqno: Option<u64>,
    last_sample: [i32; CHANNELS],
    samples_per_channel: u64,
    diagnostics: Vec<String>,
}

enum BlockOutcome {
    Decoded,
    Skipped,
    AbortFile,
}

impl Decoder {
    fn create(outdir: &Path) -> EngineResult<Self> {
        let mut writers = Vec::with_capacity(CHANNELS);
        for ch in 0..CHANNELS {
            writers.push(ChannelWriter::create(
                &outdir.join(channel_artifact_name(ch)),
            )?);
        }
        Ok(Self {
            writers,
            last_seqno: None,
            last_sample: [0; CHANNELS],
            samples_per_channel: 0,
            diagnostics: Vec::new(),
        })
    }

    /// Parse one capture file. Sequence state carries across files; a
    /// malformed envelope records a diagnostic and abandons the rest of this
    /// file only.
    fn decode_file(&mut self, path: &Path) -> EngineResult<()> {
        let file = File::open(path)?;
        let mut reader = BufReader::with_capacity(1 << 20, file);
        let mut offset: u64 = 0;
        let mut envelope = [0u8; ENVELOPE_LEN];
        let mut body = Vec::new();

        loop {
            match read_exact_or_eof(&mut reader, &mut envelope) {
                Ok(true) => {}
                Ok(false) => return Ok(()), // clean end of file
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.diag(format!(
                        "Truncated envelope in '{}' near {offset}",
                        path.display()
                    ));
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }

            let mut buf = &envelope[..];
            let magic = buf.get_u16();
            let kind = buf.get_u16();
            let body_len = buf.get_u32() as usize;
            let _rx_sec = buf.get_u32();
            let _rx_ns = buf.get_u32();

            if magic != MAGIC || body_len > MAX_BODY_LEN {
                self.diag(format!(
                    "Corrupt envelope in '{}' near {offset}",
                    path.display()
                ));
                return Ok(());
            }

            body.resize(body_len, 0);
            match read_exact_or_eof(&mut reader, &mut body) {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    self.diag(format!(
                        "Truncated block in '{}' near {offset}",
                        path.display()
                    ));
                    return Ok(());
                }
            }
            offset += (ENVELOPE_LEN + body_len) as u64;

            match kind {
                KIND_NO_LIMITS | KIND_WITH_LIMITS => {}
                other => {
                    // Foreign traffic in the capture; not a fault.
                    debug!("skipping block kind {other:#06x} in {}", path.display());
                    continue;
                }
            }

            match self.process_block(kind, &body, path, offset)? {
                BlockOutcome::Decoded | BlockOutcome::Skipped => {}
                BlockOutcome::AbortFile => return Ok(()),
            }
        }
    }

    fn process_block(
        &mut self,
        kind: u16,
        body: &[u8],
        path: &Path,
        offset: u64,
    ) -> EngineResult<BlockOutcome> {
        let prefix_len = if kind == KIND_WITH_LIMITS {
            BLOCK_PREFIX_LEN + LIMITS_LEN
        } else {
            BLOCK_PREFIX_LEN
        };
        if body.len() < prefix_len {
            self.diag(format!(
                "Corrupt block in '{}' near {offset}",
                path.display()
            ));
            return Ok(BlockOutcome::AbortFile);
        }

        let mut buf = &body[..];
        let _status = buf.get_u32();
        let _reserved = buf.get_u32();
        let seqno = buf.get_u64();
        let _marker = buf.get_u32();
        let _reserved2 = buf.get_u32();
        if kind == KIND_WITH_LIMITS {
            // Limit markers: recorded on the wire but opaque here.
            buf.advance(LIMITS_LEN);
        }

        let payload = buf;
        if payload.len() % GROUP_LEN != 0 {
            // A block only ever carries complete time points.
            self.diag(format!(
                "Truncated sample group in '{}' near {offset}",
                path.display()
            ));
            return Ok(BlockOutcome::AbortFile);
        }
        let groups = payload.len() / GROUP_LEN;

        match self.last_seqno {
            Some(last) if seqno <= last => {
                self.diag(format!(
                    "Out-of-order block {seqno} after {last} in '{}'",
                    path.display()
                ));
                return Ok(BlockOutcome::Skipped);
            }
            Some(last) if seqno > last + 1 => {
                // eg. expect 15, have 17: 15 and 16 missing.
                let missing = seqno - (last + 1);
                if missing > MAX_GAP_BLOCKS {
                    self.diag(format!(
                        "Implausible sequence jump {seqno} after {last} in '{}'",
                        path.display()
                    ));
                    return Ok(BlockOutcome::Skipped);
                }
                self.diag(format!("Missing {missing} [{}, {seqno})", last + 1));
                self.synthesize(missing)?;
            }
            _ => {}
        }

        for group in 0..groups {
            for ch in 0..CHANNELS {
                let sample = sample_at(payload, group * CHANNELS + ch);
                self.last_sample[ch] = sample;
                self.writers[ch].push(sample)?;
            }
        }
        self.samples_per_channel += groups as u64;
        self.last_seqno = Some(seqno);
        Ok(BlockOutcome::Decoded)
    }

    /// Flat-hold fill for `missing` lost blocks: every channel repeats its
    /// last real sample, preserving alignment and output length.
    fn synthesize(&mut self, missing: u64) -> io::Result<()> {
        for _ in 0..missing * GROUPS_PER_BLOCK {
            for ch in 0..CHANNELS {
                let sample = self.last_sample[ch];
                self.writers[ch].push(sample)?;
            }
        }
        self.samples_per_channel += missing * GROUPS_PER_BLOCK;
        Ok(())
    }

    fn finish(self) -> EngineResult<DecodeOutput> {
        for writer in self.writers {
            writer.finalize()?;
        }
        Ok(DecodeOutput {
            samples_per_channel: self.samples_per_channel,
            diagnostics: self.diagnostics,
        })
    }

    fn diag(&mut self, msg: String) {
        debug!("decode diagnostic: {msg}");
        self.diagnostics.push(msg);
    }
}

/// Big-endian signed 24-bit sample at `index`, sign-extended to 32 bits.
fn sample_at(payload: &[u8], index: usize) -> i32 {
    let b = &payload[index * 3..index * 3 + 3];
    let raw = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
    ((raw << 8) as i32) >> 8
}

/// Fill `buf` completely. `Ok(false)` means the reader was already exactly at
/// end of input; a partial fill is `UnexpectedEof`.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        filled += n;
    }
    Ok(true)
}

/// One channel's `.j` artifact: a 5x4-byte header then native-endian `i32`
/// samples. Created with an invalid placeholder header so a crash mid-decode
/// cannot leave a file that parses as complete; finalized in place.
struct ChannelWriter {
    file: BufWriter<File>,
    samples: u64,
}

impl ChannelWriter {
    fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut file = BufWriter::new(file);
        let placeholder: [u32; 5] = [0xffff_ffff, 0xffff_ffff, 0xffff_ffff, 0, 0];
        for word in placeholder {
            file.write_all(&word.to_ne_bytes())?;
        }
        Ok(Self { file, samples: 0 })
    }

    fn push(&mut self, sample: i32) -> io::Result<()> {
        self.file.write_all(&sample.to_ne_bytes())?;
        self.samples += 1;
        Ok(())
    }

    fn finalize(self) -> io::Result<()> {
        let mut file = self
            .file
            .into_inner()
            .map_err(io::IntoInnerError::into_error)?;
        file.seek(SeekFrom::Start(0))?;
        for word in [ARTIFACT_VERSION, 0, 0] {
            file.write_all(&word.to_ne_bytes())?;
        }
        // Payload byte length occupies the last two header fields as one
        // native-endian u64.
        let payload = self.samples * u64::from(u32::BITS / 8);
        file.write_all(&payload.to_ne_bytes())?;
        file.sync_data()?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{expected_channel as expected, make_packets, read_artifact};
    use super::*;
    use std::fs;

    fn write_capture(dir: &Path, name: &str, packets: &[Vec<u8>]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, packets.concat()).unwrap();
        path
    }

    #[test]
    fn packet_builder_matches_wire_layout() {
        let pkts = make_packets(14 * 32, 0, true);
        assert_eq!(pkts.len(), 1);
        assert_eq!(pkts[0].len(), 16 + 0x568);
        assert_eq!(&pkts[0][..4], b"PSNB");

        let pkts2 = make_packets(15 * 32, 0, true);
        assert_eq!(pkts2.len(), 2);
        assert_eq!(pkts2[0], pkts[0]);
    }

    #[test]
    fn clean_decode_round_trips_every_channel() {
        let dir = tempfile::tempdir().unwrap();
        let nsamp = 32 * 20;
        let input = write_capture(dir.path(), "input.dat", &make_packets(nsamp, 0x0102_0304, true));

        let out = convert_capture(&[input], dir.path()).unwrap();
        assert!(out.diagnostics.is_empty());
        assert_eq!(out.samples_per_channel, 20);
        for ch in 0..CHANNELS {
            // Sample value n lands in channel n % 32 at ordinal n / 32.
            assert_eq!(read_artifact(dir.path(), ch), expected(ch, nsamp));
        }
    }

    #[test]
    fn single_partial_packet() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_capture(dir.path(), "input.dat", &make_packets(32 * 2, 7, true));

        let out = convert_capture(&[input], dir.path()).unwrap();
        assert!(out.diagnostics.is_empty());
        assert_eq!(out.samples_per_channel, 2);
        for ch in 0..CHANNELS {
            assert_eq!(read_artifact(dir.path(), ch), vec![ch as i32, ch as i32 + 32]);
        }
    }

    #[test]
    fn capture_split_across_files_is_one_stream() {
        let dir = tempfile::tempdir().unwrap();
        let pkts = make_packets(32 * 100, 0x0102_0304, true);
        let part1 = write_capture(dir.path(), "part1.dat", &pkts[..3]);
        let part2 = write_capture(dir.path(), "part2.dat", &pkts[3..]);

        let out = convert_capture(&[part1, part2], dir.path()).unwrap();
        assert!(out.diagnostics.is_empty());
        assert_eq!(out.samples_per_channel, 100);
        for ch in 0..CHANNELS {
            assert_eq!(read_artifact(dir.path(), ch), expected(ch, 32 * 100));
        }
    }

    #[test]
    fn one_lost_block_is_flat_held() {
        let dir = tempfile::tempdir().unwrap();
        let mut pkts = make_packets(32 * 98, 1200, true);
        assert_eq!(pkts.len(), 7);
        pkts.remove(3);
        let input = write_capture(dir.path(), "input.dat", &pkts);

        let out = convert_capture(&[input], dir.path()).unwrap();
        assert_eq!(out.diagnostics, vec!["Missing 1 [1203, 1204)".to_string()]);
        assert_eq!(out.samples_per_channel, 98);
        for ch in 0..CHANNELS {
            let mut want = expected(ch, 32 * 98);
            let pos = 3 * 14; // first synthesized sample
            let hold = want[pos - 1];
            for slot in &mut want[pos..pos + 14] {
                *slot = hold;
            }
            assert_eq!(read_artifact(dir.path(), ch), want);
        }
    }

    #[test]
    fn two_lost_blocks_are_flat_held() {
        let dir = tempfile::tempdir().unwrap();
        let mut pkts = make_packets(32 * 98, 1200, true);
        assert_eq!(pkts.len(), 7);
        pkts.drain(3..5);
        let input = write_capture(dir.path(), "input.dat", &pkts);

        let out = convert_capture(&[input], dir.path()).unwrap();
        assert_eq!(out.diagnostics, vec!["Missing 2 [1203, 1205)".to_string()]);
        assert_eq!(out.samples_per_channel, 98);
        for ch in 0..CHANNELS {
            let mut want = expected(ch, 32 * 98);
            let pos = 3 * 14;
            let hold = want[pos - 1];
            for slot in &mut want[pos..pos + 28] {
                *slot = hold;
            }
            assert_eq!(read_artifact(dir.path(), ch), want);
        }
    }

    #[test]
    fn blocks_without_limit_markers_decode_too() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_capture(dir.path(), "input.dat", &make_packets(32 * 14, 5, false));

        let out = convert_capture(&[input], dir.path()).unwrap();
        assert!(out.diagnostics.is_empty());
        assert_eq!(out.samples_per_channel, 14);
        for ch in 0..CHANNELS {
            assert_eq!(read_artifact(dir.path(), ch), expected(ch, 32 * 14));
        }
    }

    #[test]
    fn corrupt_file_aborts_only_itself() {
        let dir = tempfile::tempdir().unwrap();
        let good = make_packets(32 * 14, 0, true);
        let later = make_packets(32 * 14, 1, true);
        let bad = write_capture(dir.path(), "bad.dat", &[vec![b'X'; 32]]);
        let first = write_capture(dir.path(), "first.dat", &good);
        let second = write_capture(dir.path(), "second.dat", &later);

        let out = convert_capture(&[first, bad, second], dir.path()).unwrap();
        assert_eq!(out.samples_per_channel, 28);
        assert_eq!(out.diagnostics.len(), 1);
        assert!(out.diagnostics[0].contains("Corrupt envelope"));
        assert!(out.diagnostics[0].contains("bad.dat"));
    }

    #[test]
    fn out_of_order_block_is_skipped_without_state_change() {
        let dir = tempfile::tempdir().unwrap();
        let pkts = make_packets(32 * 20, 100, true);
        assert_eq!(pkts.len(), 2);
        // Replay the first block after the second.
        let stream = vec![pkts[0].clone(), pkts[1].clone(), pkts[0].clone()];
        let input = write_capture(dir.path(), "input.dat", &stream);

        let out = convert_capture(&[input], dir.path()).unwrap();
        assert_eq!(out.samples_per_channel, 20);
        assert_eq!(out.diagnostics.len(), 1);
        assert!(out.diagnostics[0].contains("Out-of-order block 100 after 101"));
        for ch in 0..CHANNELS {
            assert_eq!(read_artifact(dir.path(), ch), expected(ch, 32 * 20));
        }
    }

    #[test]
    fn implausible_sequence_jump_is_skipped_not_synthesized() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = make_packets(32, 100, true);
        // A flipped high bit in the sequence number, not real loss.
        stream.extend(make_packets(32, 100 + (1 << 40), true));
        stream.extend(make_packets(32, 101, true));
        let input = write_capture(dir.path(), "input.dat", &stream);

        let out = convert_capture(&[input], dir.path()).unwrap();
        assert_eq!(out.diagnostics.len(), 1);
        assert!(out.diagnostics[0].contains("Implausible sequence jump"));
        // The corrupt block advanced nothing; its successor decoded normally.
        assert_eq!(out.samples_per_channel, 2);
        for ch in 0..CHANNELS {
            assert_eq!(read_artifact(dir.path(), ch), vec![ch as i32, ch as i32]);
        }
    }

    #[test]
    fn foreign_block_kinds_are_drained() {
        let dir = tempfile::tempdir().unwrap();
        let mut foreign = Vec::new();
        foreign.extend_from_slice(b"PS");
        foreign.extend_from_slice(&0x5844u16.to_be_bytes());
        foreign.extend_from_slice(&8u32.to_be_bytes());
        foreign.extend_from_slice(&[0; 8]); // reserved
        foreign.extend_from_slice(&[0xab; 8]); // opaque body
        let mut stream = vec![foreign];
        stream.extend(make_packets(32 * 14, 3, true));
        let input = write_capture(dir.path(), "input.dat", &stream);

        let out = convert_capture(&[input], dir.path()).unwrap();
        assert!(out.diagnostics.is_empty());
        assert_eq!(out.samples_per_channel, 14);
    }

    #[test]
    fn empty_capture_still_emits_well_formed_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.dat");
        fs::write(&empty, b"").unwrap();

        let out = convert_capture(&[empty], dir.path()).unwrap();
        assert!(out.diagnostics.is_empty());
        assert_eq!(out.samples_per_channel, 0);
        for ch in 0..CHANNELS {
            assert_eq!(read_artifact(dir.path(), ch), Vec::<i32>::new());
        }
    }
}
