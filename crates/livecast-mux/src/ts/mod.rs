//! MPEG-TS multiplexer.

pub mod pcr;
pub mod pes;
pub mod psi;
mod stream;

pub use stream::{TimeBase, TsCodec, TsStreamConfig};

use livecast_ipc::{MediaKind, MuxConfig, Sample};
use tracing::{debug, trace, warn};

use self::pcr::{null_packet, pcr_bits, pcr_only_packet, pcr_to_us, us_to_pcr, PCR_TIME_BASE};
use self::pes::{
    payload_packet, pes_header, us_to_90khz, AF_DISCONTINUITY, AF_PCR, AF_RANDOM_ACCESS,
    AUDIO_STREAM_ID, VIDEO_STREAM_ID,
};
use self::psi::{
    pat_body, pmt_body, sdt_body, Section, PAT_PID, PAT_TID, PMT_TID, SDT_PID, SDT_TID,
    SERVICE_TYPE_DIGITAL_TV,
};
use crate::{MuxError, MuxResult, TsSink, TS_PACKET_SIZE};

/// Largest PID an elementary stream may use.
const MAX_PID: u16 = 0x1FFF;

/// Stream ids below this get a PID from the start PID.
const RESERVED_PID_LIMIT: u16 = 16;

/// PES headers per aggregated audio payload, before rounding.
const DEFAULT_PES_HEADER_FREQ: usize = 16;
const DEFAULT_PES_PAYLOAD_SIZE: usize = (DEFAULT_PES_HEADER_FREQ - 1) * 184 + 170;

/// SI retransmission times in CBR mode, in milliseconds.
const SDT_RETRANS_MS: u64 = 500;
const PAT_RETRANS_MS: u64 = 100;

/// Audio frames are 1024 samples; a PCR every ~10 frames per 512 samples.
const AUDIO_PCR_DIVISOR: u32 = 10 * 512;

#[derive(Debug)]
struct StreamState {
    config: TsStreamConfig,
    pid: u16,
    cc: u8,
    discontinuity: bool,
    prev_payload_key: bool,
    payload: Vec<u8>,
    payload_pts: i64,
    payload_dts: Option<i64>,
    key: bool,
}

/// Counter-based retransmission of one kind of table.
#[derive(Debug)]
struct Retransmit {
    count: u64,
    period: u64,
    period_us: Option<i64>,
    last_dts: Option<i64>,
}

impl Retransmit {
    fn new(period: u64, period_ms: Option<u64>) -> Self {
        // A wall-clock period replaces the packet period.
        let period = if period_ms.is_some() {
            u64::MAX
        } else {
            period.max(1)
        };
        Self {
            // Primed so the tables go out with the first packet.
            count: period - 1,
            period,
            period_us: period_ms.map(|ms| ms as i64 * 1000),
            last_dts: None,
        }
    }

    fn due(&mut self, dts: i64, force: bool) -> bool {
        self.count = self.count.saturating_add(1);
        let overdue = match (self.last_dts, self.period_us) {
            (Some(last), Some(period)) => dts - last > period,
            _ => false,
        };
        if self.count == self.period || self.last_dts.is_none() || overdue || force {
            self.count = 0;
            self.last_dts = Some(self.last_dts.map_or(dts, |last| last.max(dts)));
            return true;
        }
        false
    }

    fn prime(&mut self) {
        self.count = self.period - 1;
    }
}

/// Multiplexes elementary streams into a single-program transport stream.
///
/// Samples carry microsecond timestamps. Video samples become one PES
/// each; small audio frames are aggregated up to the PES payload size.
pub struct TsMuxer<S: TsSink> {
    config: MuxConfig,
    streams: Vec<StreamState>,
    pat: Section,
    pmt: Section,
    sdt: Section,
    pat_retransmit: Retransmit,
    sdt_retransmit: Retransmit,
    pcr_pid: u16,
    pcr_packet_count: u64,
    pcr_packet_period: u64,
    resend_headers: bool,
    cts_offset_us: i64,
    delay_us: i64,
    pes_payload_size: usize,
    first_pcr: i64,
    sent_bytes: u64,
    tables_version: u8,
    sink: S,
}

impl<S: TsSink> TsMuxer<S> {
    pub fn new(streams: Vec<TsStreamConfig>, config: MuxConfig, sink: S) -> MuxResult<Self> {
        if streams.is_empty() {
            return Err(MuxError::NoStreams);
        }
        if config.mux_rate == 0 {
            return Err(MuxError::InvalidConfig("mux_rate must be at least 1".to_string()));
        }
        if config.pmt_pid == 0 || config.pmt_pid >= MAX_PID {
            return Err(MuxError::InvalidConfig(format!(
                "invalid PMT PID 0x{:04X}",
                config.pmt_pid
            )));
        }

        let discontinuity = config.initial_discontinuity;
        let mut states: Vec<StreamState> = Vec::with_capacity(streams.len());
        for (index, stream) in streams.into_iter().enumerate() {
            let pid = if stream.id < RESERVED_PID_LIMIT {
                config.start_pid + index as u16
            } else if stream.id < MAX_PID {
                stream.id
            } else {
                return Err(MuxError::InvalidStreamId(stream.id));
            };
            if pid == config.pmt_pid || states.iter().any(|s| s.pid == pid) {
                return Err(MuxError::DuplicatePid(pid));
            }
            states.push(StreamState {
                config: stream,
                pid,
                cc: 15,
                discontinuity,
                prev_payload_key: false,
                payload: Vec::new(),
                payload_pts: 0,
                payload_dts: None,
                key: false,
            });
        }

        // PCR on the first video stream, else the first stream.
        let pcr_index = states.iter().position(|s| s.config.is_video()).unwrap_or(0);
        let pcr_pid = states[pcr_index].pid;
        let pcr_time_base = states[pcr_index].config.time_base;
        let pcr_kind = states[pcr_index].config.kind;

        let delay_us = config.max_delay_ms as i64 * 1000;
        let cbr = config.mux_rate > 1;
        let (pcr_packet_period, sdt_period, pat_period, first_pcr) = if cbr {
            let packets_in = |ms: u64| ms * config.mux_rate / (TS_PACKET_SIZE as u64 * 8 * 1000);
            let first_pcr = if config.copyts { 0 } else { us_to_pcr(delay_us) };
            (
                packets_in(config.pcr_period_ms).max(1),
                packets_in(SDT_RETRANS_MS),
                packets_in(PAT_RETRANS_MS),
                first_pcr,
            )
        } else {
            // PAT/PMT also go out on video keyframes.
            let pcr_period = match pcr_kind {
                MediaKind::Audio => pcr_time_base.den / AUDIO_PCR_DIVISOR,
                MediaKind::Video => pcr_time_base.den / (10 * pcr_time_base.num),
            };
            (
                u64::from(pcr_period).max(1),
                u64::from(config.sdt_packet_period),
                u64::from(config.pat_packet_period),
                0,
            )
        };

        let cts_offset_us = states
            .iter()
            .find(|s| s.config.is_video())
            .map_or(0, |s| i64::from(config.cts_offset_frames) * s.config.time_base.tick_us());

        let pes_payload_size = (DEFAULT_PES_PAYLOAD_SIZE + 14 + 183) / 184 * 184 - 14;

        let muxer = Self {
            pat: Section::new(PAT_PID, discontinuity),
            pmt: Section::new(config.pmt_pid, discontinuity),
            sdt: Section::new(SDT_PID, discontinuity),
            pat_retransmit: Retransmit::new(pat_period, config.pat_period_ms),
            sdt_retransmit: Retransmit::new(sdt_period, config.sdt_period_ms),
            pcr_pid,
            // Output a PCR as soon as possible.
            pcr_packet_count: pcr_packet_period,
            pcr_packet_period,
            resend_headers: false,
            cts_offset_us,
            delay_us,
            pes_payload_size,
            first_pcr,
            sent_bytes: 0,
            tables_version: 0,
            streams: states,
            config,
            sink,
        };

        debug!(
            mux_rate = if cbr { muxer.config.mux_rate } else { 0 },
            pcr_pid = muxer.pcr_pid,
            pcr_period = muxer.pcr_packet_period,
            sdt_period = muxer.sdt_retransmit.period,
            pat_period = muxer.pat_retransmit.period,
            "TS muxer configured"
        );
        Ok(muxer)
    }

    /// PID of each stream, in configuration order.
    pub fn pids(&self) -> Vec<u16> {
        self.streams.iter().map(|s| s.pid).collect()
    }

    pub fn pcr_pid(&self) -> u16 {
        self.pcr_pid
    }

    /// Bytes handed to the sink so far.
    pub fn bytes_written(&self) -> u64 {
        self.sent_bytes
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Re-emit PAT/PMT and SDT before the next packet.
    pub fn resend_headers(&mut self) {
        self.resend_headers = true;
    }

    /// Mux one sample of stream `index`.
    pub fn push(&mut self, sample: &Sample, index: usize) -> MuxResult<()> {
        let Some(stream) = self.streams.get(index) else {
            return Err(MuxError::UnknownStream(index));
        };
        if sample.is_config {
            trace!(stream = index, "Skipping codec configuration sample");
            return Ok(());
        }
        let kind = stream.config.kind;

        let mut pts = sample.pts + self.cts_offset_us;
        let mut dts = sample.dts.unwrap_or(match kind {
            MediaKind::Video => pts - self.cts_offset_us,
            MediaKind::Audio => pts,
        });

        if self.resend_headers {
            self.pat_retransmit.prime();
            self.sdt_retransmit.prime();
            self.resend_headers = false;
        }

        if !self.config.copyts {
            pts += self.delay_us;
            dts += self.delay_us;
        }

        // Pending audio that has waited long enough goes out first.
        for i in 0..self.streams.len() {
            let st = &self.streams[i];
            let stale = st
                .payload_dts
                .map_or(true, |payload_dts| dts - payload_dts > self.delay_us / 2);
            if !st.payload.is_empty() && stale {
                self.flush_stream(i)?;
            }
        }

        let size = sample.payload.len();
        let st = &self.streams[index];
        if !st.payload.is_empty()
            && (st.payload.len() + size > self.pes_payload_size
                || st
                    .payload_dts
                    .is_some_and(|payload_dts| dts - payload_dts > self.delay_us))
        {
            self.flush_stream(index)?;
        }

        if kind != MediaKind::Audio || size > self.pes_payload_size {
            return self.write_pes(index, &sample.payload, pts, dts, sample.is_keyframe);
        }

        let st = &mut self.streams[index];
        if st.payload.is_empty() {
            st.payload_pts = pts;
            st.payload_dts = Some(dts);
            st.key = sample.is_keyframe;
        }
        st.payload.extend_from_slice(&sample.payload);
        Ok(())
    }

    /// Write out every pending aggregated payload.
    pub fn flush(&mut self) -> MuxResult<()> {
        for i in 0..self.streams.len() {
            self.flush_stream(i)?;
        }
        Ok(())
    }

    fn flush_stream(&mut self, index: usize) -> MuxResult<()> {
        let st = &mut self.streams[index];
        if st.payload.is_empty() {
            return Ok(());
        }
        let payload = std::mem::take(&mut st.payload);
        let (pts, dts, key) = (st.payload_pts, st.payload_dts.unwrap_or(st.payload_pts), st.key);
        st.payload_dts = None;

        let result = self.write_pes(index, &payload, pts, dts, key);

        let mut payload = payload;
        payload.clear();
        self.streams[index].payload = payload;
        result
    }

    fn is_cbr(&self) -> bool {
        self.config.mux_rate > 1
    }

    /// Clock derived from the bytes written so far, in 27 MHz ticks.
    fn current_pcr(&self) -> i64 {
        let ticks = u128::from(self.sent_bytes) * 8 * PCR_TIME_BASE as u128
            / u128::from(self.config.mux_rate);
        ticks as i64 + self.first_pcr
    }

    fn write_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]) {
        if self.config.m2ts {
            let arrival = (self.current_pcr() % 0x3FFF_FFFF) as u32;
            self.sink.write(&arrival.to_be_bytes());
            self.sent_bytes += 4;
        }
        self.sink.write(packet);
        self.sent_bytes += TS_PACKET_SIZE as u64;
    }

    fn write_table_packets(&mut self, packets: Vec<[u8; TS_PACKET_SIZE]>) {
        for packet in &packets {
            self.write_packet(packet);
        }
    }

    fn write_pat(&mut self) -> MuxResult<()> {
        let body = pat_body(self.config.service_id, self.config.pmt_pid);
        let packets = self
            .pat
            .packets(PAT_TID, self.config.transport_stream_id, self.tables_version, &body)?;
        self.write_table_packets(packets);
        Ok(())
    }

    fn write_pmt(&mut self) -> MuxResult<()> {
        let entries: Vec<(u8, u16)> = self
            .streams
            .iter()
            .map(|s| (s.config.codec.stream_type(), s.pid))
            .collect();
        let body = pmt_body(self.pcr_pid, &entries);
        let packets = self
            .pmt
            .packets(PMT_TID, self.config.service_id, self.tables_version, &body)?;
        self.write_table_packets(packets);
        Ok(())
    }

    fn write_sdt(&mut self) -> MuxResult<()> {
        let body = sdt_body(
            self.config.original_network_id,
            self.config.service_id,
            SERVICE_TYPE_DIGITAL_TV,
            &self.config.provider_name,
            &self.config.service_name,
        );
        let packets = self
            .sdt
            .packets(SDT_TID, self.config.transport_stream_id, self.tables_version, &body)?;
        self.write_table_packets(packets);
        Ok(())
    }

    /// Send SDT, PAT and PMT when their periods are up.
    fn retransmit_si_info(&mut self, force_pat: bool, dts: i64) -> MuxResult<()> {
        if self.sdt_retransmit.due(dts, false) {
            self.write_sdt()?;
        }
        if self.pat_retransmit.due(dts, force_pat) {
            self.write_pat()?;
            self.write_pmt()?;
        }
        Ok(())
    }

    fn insert_pcr_only(&mut self, index: usize) {
        let pcr = self.current_pcr();
        let st = &mut self.streams[index];
        let packet = pcr_only_packet(st.pid, st.cc, st.discontinuity, pcr);
        st.discontinuity = false;
        self.write_packet(&packet);
    }

    /// Packetize one PES. `pts` and `dts` are microseconds.
    fn write_pes(
        &mut self,
        index: usize,
        payload: &[u8],
        pts: i64,
        dts: i64,
        key: bool,
    ) -> MuxResult<()> {
        let is_video = self.streams[index].config.is_video();
        let pid = self.streams[index].pid;
        let mut force_pat = is_video && key && !self.streams[index].prev_payload_key;
        if self.config.pat_pmt_at_frames && is_video {
            force_pat = true;
        }

        let mut is_start = true;
        let mut offset = 0;
        while offset < payload.len() {
            self.retransmit_si_info(force_pat, dts)?;
            force_pat = false;

            let mut write_pcr = false;
            if pid == self.pcr_pid {
                // VBR PCR period counts frames.
                if self.is_cbr() || is_start {
                    self.pcr_packet_count += 1;
                }
                if self.pcr_packet_count >= self.pcr_packet_period {
                    self.pcr_packet_count = 0;
                    write_pcr = true;
                }
            }

            if self.is_cbr() && dts - pcr_to_us(self.current_pcr()) > self.delay_us {
                // A due PCR takes priority over stuffing.
                if write_pcr {
                    self.insert_pcr_only(index);
                } else {
                    self.write_packet(&null_packet());
                }
                continue;
            }

            let mut adaptation: Option<Vec<u8>> = None;
            let st = &mut self.streams[index];
            if st.discontinuity {
                set_flag(&mut adaptation, AF_DISCONTINUITY);
                st.discontinuity = false;
            }
            if key && is_start {
                if pid == self.pcr_pid {
                    write_pcr = true;
                }
                set_flag(&mut adaptation, AF_RANDOM_ACCESS);
            }
            if write_pcr {
                set_flag(&mut adaptation, AF_PCR);
                let pcr = if self.is_cbr() {
                    self.current_pcr()
                } else {
                    us_to_pcr(dts - self.delay_us)
                };
                if us_to_pcr(dts) < pcr {
                    warn!(dts, pcr, "dts < pcr, TS is invalid");
                }
                if let Some(body) = adaptation.as_mut() {
                    body.extend_from_slice(&pcr_bits(pcr));
                }
            }

            let header = if is_start {
                let stream_id = if is_video { VIDEO_STREAM_ID } else { AUDIO_STREAM_ID };
                pes_header(
                    stream_id,
                    payload.len(),
                    us_to_90khz(pts),
                    us_to_90khz(dts),
                    is_video,
                )
            } else {
                Vec::new()
            };

            let st = &mut self.streams[index];
            st.cc = (st.cc + 1) & 0x0F;
            let (packet, used) = payload_packet(
                pid,
                st.cc,
                is_start,
                adaptation,
                &header,
                &payload[offset..],
            );
            self.write_packet(&packet);
            offset += used;
            is_start = false;
        }

        self.streams[index].prev_payload_key = key;
        self.sink.end_of_pes();
        Ok(())
    }
}

/// Set `flag` in the adaptation field, creating it if needed.
fn set_flag(adaptation: &mut Option<Vec<u8>>, flag: u8) {
    adaptation.get_or_insert_with(|| vec![0])[0] |= flag;
}
