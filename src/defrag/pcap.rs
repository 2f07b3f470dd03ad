// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Classic pcap capture files: reading, writing and replay through a [`Manager`].
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::defrag::protocol::{FullPacket, GroupId};
use crate::errors::{Error, Result};
use crate::manager::Manager;

const PCAP_MAGIC: u32 = 0xa1b2c3d4;
const PCAP_MAGIC_SWAPPED: u32 = 0xd4c3b2a1;
const PCAP_MAGIC_NANOS: u32 = 0xa1b23c4d;
const PCAP_MAGIC_NANOS_SWAPPED: u32 = 0x4d3cb2a1;
const PCAP_HEADER_SIZE: usize = 24;
const PACKET_HEADER_SIZE: usize = 16;
const LINKTYPE_ETHERNET: u32 = 1;
const DEFAULT_SNAPLEN: u32 = 262_144;

/// Largest record a reader will accept, regardless of the file's snaplen.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// How many reassembled packets replay pulls off the output queue at a time.
const POP_BATCH: usize = 256;

/// One captured frame.
#[derive(Debug, Clone)]
pub struct PcapRecord {
    /// Zero-based position in the file.
    pub index: u64,
    pub timestamp: SystemTime,
    pub orig_len: u32,
    pub data: Vec<u8>,
}

fn read_u32(buf: &[u8], at: usize, swapped: bool) -> u32 {
    let bytes = [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]];
    if swapped {
        u32::from_be_bytes(bytes)
    } else {
        u32::from_le_bytes(bytes)
    }
}

/// Reads classic pcap files in either byte order, microsecond or nanosecond resolution.
pub struct PcapReader<R: Read> {
    inner: R,
    swapped: bool,
    nanos: bool,
    snaplen: u32,
    link_type: u32,
    next_index: u64,
}

impl PcapReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> PcapReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let mut header = [0u8; PCAP_HEADER_SIZE];
        inner.read_exact(&mut header)?;
        let magic = read_u32(&header, 0, false);
        let (swapped, nanos) = match magic {
            PCAP_MAGIC => (false, false),
            PCAP_MAGIC_SWAPPED => (true, false),
            PCAP_MAGIC_NANOS => (false, true),
            PCAP_MAGIC_NANOS_SWAPPED => (true, true),
            _ => return Err(Error::Parse(format!("invalid pcap magic number {magic:#010x}"))),
        };
        let snaplen = read_u32(&header, 16, swapped);
        let link_type = read_u32(&header, 20, swapped);
        if link_type != LINKTYPE_ETHERNET {
            return Err(Error::Parse(format!(
                "unsupported pcap link type {link_type}, only ethernet is handled"
            )));
        }
        Ok(Self {
            inner,
            swapped,
            nanos,
            snaplen,
            link_type,
            next_index: 0,
        })
    }

    pub fn link_type(&self) -> u32 {
        self.link_type
    }

    pub fn snaplen(&self) -> u32 {
        self.snaplen
    }

    pub fn is_swapped(&self) -> bool {
        self.swapped
    }

    /// Returns `Ok(None)` at a clean end of file. A record cut short is an error.
    pub fn next_record(&mut self) -> Result<Option<PcapRecord>> {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        match self.inner.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let ts_sec = read_u32(&header, 0, self.swapped);
        let ts_frac = read_u32(&header, 4, self.swapped);
        let incl_len = read_u32(&header, 8, self.swapped) as usize;
        let orig_len = read_u32(&header, 12, self.swapped);
        if incl_len > MAX_RECORD_LEN {
            return Err(Error::Parse(format!(
                "record {} claims {incl_len} captured bytes",
                self.next_index
            )));
        }

        let mut data = vec![0u8; incl_len];
        self.inner.read_exact(&mut data)?;

        let frac = if self.nanos {
            Duration::from_nanos(ts_frac as u64)
        } else {
            Duration::from_micros(ts_frac as u64)
        };
        let timestamp = UNIX_EPOCH
            .checked_add(Duration::from_secs(ts_sec as u64))
            .and_then(|t| t.checked_add(frac))
            .unwrap_or(UNIX_EPOCH);

        let record = PcapRecord {
            index: self.next_index,
            timestamp,
            orig_len,
            data,
        };
        self.next_index += 1;
        Ok(Some(record))
    }
}

impl<R: Read> Iterator for PcapReader<R> {
    type Item = Result<PcapRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Writes little-endian, microsecond resolution, ethernet pcap files.
pub struct PcapWriter<W: Write> {
    inner: W,
}

impl PcapWriter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file))
    }
}

impl<W: Write> PcapWriter<W> {
    pub fn new(mut inner: W) -> Result<Self> {
        let mut header = Vec::with_capacity(PCAP_HEADER_SIZE);
        header.extend_from_slice(&PCAP_MAGIC.to_le_bytes());
        header.extend_from_slice(&2u16.to_le_bytes());
        header.extend_from_slice(&4u16.to_le_bytes());
        header.extend_from_slice(&0i32.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&DEFAULT_SNAPLEN.to_le_bytes());
        header.extend_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
        inner.write_all(&header)?;
        Ok(Self { inner })
    }

    pub fn write_record(&mut self, timestamp: SystemTime, frame: &[u8]) -> Result<()> {
        let since_epoch = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
        let len = u32::try_from(frame.len())
            .map_err(|_| Error::Parse(format!("frame of {} bytes is too large", frame.len())))?;
        let mut header = [0u8; PACKET_HEADER_SIZE];
        header[0..4].copy_from_slice(&(since_epoch.as_secs() as u32).to_le_bytes());
        header[4..8].copy_from_slice(&since_epoch.subsec_micros().to_le_bytes());
        header[8..12].copy_from_slice(&len.to_le_bytes());
        header[12..16].copy_from_slice(&len.to_le_bytes());
        self.inner.write_all(&header)?;
        self.inner.write_all(frame)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Replay ends once no packet has been reassembled for this long.
    pub settle: Duration,
    /// Keep the reassembled frames in the report, e.g. to write them out afterwards.
    pub keep_packets: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(500),
            keep_packets: false,
        }
    }
}

/// One reassembled datagram as reported by a replay.
#[derive(Debug, Clone, Serialize)]
pub struct ReassembledEntry {
    /// Index of the record that completed the group.
    pub record: u64,
    pub group_id: GroupId,
    pub fragments: usize,
    pub len: usize,
    pub payload_len: usize,
    pub protocol: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    /// Capture time of the completing record, RFC 3339.
    pub completed_at: String,
    #[serde(skip)]
    pub timestamp: SystemTime,
}

#[derive(Debug, Default, Serialize)]
pub struct ReplayReport {
    pub records: usize,
    pub fragments: usize,
    pub errors: Vec<String>,
    pub reassembled: Vec<ReassembledEntry>,
    /// Groups that were seen but never completed.
    pub incomplete: Vec<(GroupId, usize)>,
    #[serde(skip_serializing)]
    pub packets: Vec<FullPacket>,
}

impl fmt::Display for ReplayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# PCAP Replay Report")?;
        writeln!(f, "{} records", self.records)?;
        writeln!(f, "{} fragments", self.fragments)?;
        writeln!(f, "{} reassembled packets", self.reassembled.len())?;
        writeln!(f, "{} incomplete groups", self.incomplete.len())?;
        writeln!(f, "{} errors", self.errors.len())?;

        writeln!(f, "\n## Reassembled Packets")?;
        for entry in &self.reassembled {
            writeln!(
                f,
                "  {} from {} to {} proto {} fragments {} len {} payload {} record {} pcap_ts {}",
                entry.group_id,
                entry.src_ip,
                entry.dst_ip,
                entry.protocol,
                entry.fragments,
                entry.len,
                entry.payload_len,
                entry.record,
                entry.completed_at
            )?;
        }

        if !self.incomplete.is_empty() {
            writeln!(f, "\n## Incomplete Groups")?;
            for (group_id, fragments) in &self.incomplete {
                writeln!(f, "  {group_id} with {fragments} fragments")?;
            }
        }

        writeln!(f, "\n## Errors")?;
        for (i, error) in self.errors.iter().enumerate() {
            writeln!(f, "  {}. {}", i + 1, error)?;
        }
        Ok(())
    }
}

fn format_timestamp(ts: SystemTime) -> String {
    DateTime::<Utc>::from(ts).to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Fragments seen so far for one group, with the capture time of each.
#[derive(Debug, Default)]
struct SeenGroup {
    stamps: HashMap<u64, SystemTime>,
}

/// Feeds every record of `path` through `manager`, using the record index as mark,
/// and collects what comes out. The manager must already be started.
///
/// Only the timestamps of fragments belonging to groups still open are held in memory.
/// Reassembled frames are kept in [`ReplayReport::packets`] only when
/// [`ReplayOptions::keep_packets`] is set.
pub async fn replay<P: AsRef<Path>>(
    manager: &Manager,
    path: P,
    options: &ReplayOptions,
) -> Result<ReplayReport> {
    let path = path.as_ref();
    let reader = PcapReader::open(path)?;
    info!("replaying {}", path.display());

    let mut report = ReplayReport::default();
    let mut seen: HashMap<GroupId, SeenGroup> = HashMap::new();

    for record in reader {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                report.errors.push(format!("read failed: {e}"));
                break;
            }
        };
        report.records += 1;

        let (index, timestamp) = (record.index, record.timestamp);
        let result = manager
            .process_packet_with(&record.data, index, |group_id| {
                seen.entry(*group_id)
                    .or_default()
                    .stamps
                    .insert(index, timestamp);
            })
            .await;
        match result {
            Ok(()) => {}
            Err(Error::Detect(e)) => report.errors.push(format!("record {index}: {e}")),
            Err(e) => return Err(e),
        }

        if manager.pending_full_packets() >= POP_BATCH {
            let batch = manager.pop_full_packets(POP_BATCH)?;
            record_batch(&mut report, &mut seen, batch, options.keep_packets);
        }
    }

    let poll = (options.settle / 10).max(Duration::from_millis(1));
    let mut last_activity = Instant::now();
    loop {
        let batch = manager.pop_full_packets(POP_BATCH)?;
        if !batch.is_empty() {
            last_activity = Instant::now();
            record_batch(&mut report, &mut seen, batch, options.keep_packets);
            continue;
        }
        if last_activity.elapsed() >= options.settle {
            break;
        }
        sleep(poll).await;
    }

    report.fragments += seen.values().map(|g| g.stamps.len()).sum::<usize>();
    report.incomplete = seen
        .into_iter()
        .map(|(id, group)| (id, group.stamps.len()))
        .collect();
    report.incomplete.sort_by_key(|(id, _)| id.to_string());

    if !report.incomplete.is_empty() {
        warn!("{} groups never completed", report.incomplete.len());
    }
    debug!(
        "replay of {} records produced {} packets",
        report.records,
        report.reassembled.len()
    );
    Ok(report)
}

fn record_batch(
    report: &mut ReplayReport,
    seen: &mut HashMap<GroupId, SeenGroup>,
    batch: Vec<FullPacket>,
    keep_packets: bool,
) {
    for packet in batch {
        let record = packet.mark();
        let group = seen.remove(packet.group_id()).unwrap_or_default();
        let timestamp = group.stamps.get(&record).copied().unwrap_or(UNIX_EPOCH);
        let fragments = group.stamps.len();
        report.fragments += fragments;
        report.reassembled.push(ReassembledEntry {
            record,
            group_id: *packet.group_id(),
            fragments,
            len: packet.bytes().len(),
            payload_len: packet.view.payload_len,
            protocol: packet.view.protocol,
            src_ip: packet.view.src_ip,
            dst_ip: packet.view.dst_ip,
            completed_at: format_timestamp(timestamp),
            timestamp,
        });
        if keep_packets {
            report.packets.push(packet);
        }
    }
}

/// Writes every reassembled packet of `report` to a new capture file.
pub fn write_reassembled<P: AsRef<Path>>(report: &ReplayReport, path: P) -> Result<usize> {
    if report.packets.len() != report.reassembled.len() {
        return Err(Error::InvalidOption(
            "replay did not keep the reassembled packets".into(),
        ));
    }
    let mut writer = PcapWriter::create(path)?;
    for (packet, entry) in report.packets.iter().zip(&report.reassembled) {
        writer.write_record(entry.timestamp, packet.bytes())?;
    }
    writer.finish()?;
    Ok(report.packets.len())
}
