//! The protocol state machine: request decoding, transfer bookkeeping, and
//! object-dictionary access for one SDO channel
//!
//! `SdoServer` holds the phase state (§4.5) and is driven by `process()`,
//! called once per incoming request and once per timer tick by the caller's
//! mainline loop. Block-download sub-block reception is handled off the fast
//! path by [`SdoReceiver`]; everything else runs synchronously here.

use defmt_or_log::warn;
use int_enum::IntEnum as _;

use canopen_common::crc::Crc16Ccitt;
use canopen_common::sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse};

use crate::binding::CobBinding;
use crate::config::ServerConfig;
use crate::od::{find_object_entry, ODEntry};
use crate::receiver::{ReceiverState, SdoReceiver, SDO_BUF_SIZE};

/// Always offer the maximum block size; the buffer is exactly `127 * 7` bytes, so a
/// block download or upload sub-block never has to span a partial buffer refill.
const BLKSIZE: u8 = 127;

/// Identifies the object a completed download or upload touched
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectId {
    /// Object index
    pub index: u16,
    /// Sub index
    pub sub: u8,
}

/// A coarse classification of what a `process()` call accomplished
///
/// `process()` itself never owns the bus `send()` call the way the reference state machine
/// does (the caller transmits the returned frame on its own schedule), so there's no
/// `TRANSMIT_BUFFER_FULL` case here: that condition belongs to the caller's send path, not
/// this one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing to report this call: either truly idle, or mid-transfer with no new frame and
    /// no timeout yet
    Ok,
    /// A response frame is ready for the caller to transmit
    ResponseReady,
    /// A block download's sub-block is still streaming in via the ISR fast path
    BlockDownloadInProgress,
    /// A block upload is streaming segments out via `poll_block_upload_segment`
    BlockUploadInProgress,
    /// The transfer just ended with an abort frame
    EndedWithAbort,
}

impl ProcessOutcome {
    fn classify(state: &SdoState, response: Option<SdoResponse>) -> Self {
        if matches!(response, Some(SdoResponse::Abort { .. })) {
            return Self::EndedWithAbort;
        }
        if response.is_some() {
            return Self::ResponseReady;
        }
        match state {
            SdoState::DownloadBlock(_) | SdoState::EndDownloadBlock(_) => {
                Self::BlockDownloadInProgress
            }
            SdoState::UploadBlock(_) | SdoState::EndUploadBlock(_) => {
                Self::BlockUploadInProgress
            }
            SdoState::Idle | SdoState::DownloadSegmented(_) | SdoState::UploadSegmented(_) => {
                Self::Ok
            }
        }
    }
}

fn validate_download_size(
    dl_size: usize,
    subobj: &crate::od::SubInfo,
) -> Result<(), AbortCode> {
    if subobj.size == 0 {
        // Domain objects report a size of 0; we just write and see if it fails.
        return Ok(());
    }
    if subobj.data_type.is_str() || subobj.data_type.is_domain() {
        if dl_size > subobj.size {
            return Err(AbortCode::ParameterTooLong);
        }
    } else if dl_size < subobj.size {
        return Err(AbortCode::ParameterTooShort);
    } else if dl_size > subobj.size {
        return Err(AbortCode::ParameterTooLong);
    }
    Ok(())
}

struct SdoResult {
    response: Option<SdoResponse>,
    updated_object: Option<ObjectId>,
    new_state: SdoState,
}

impl SdoResult {
    fn no_response(new_state: SdoState) -> Self {
        Self {
            response: None,
            updated_object: None,
            new_state,
        }
    }

    fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        warn!(
            "SDO abort 0x{:x} on 0x{:x}.{}",
            abort_code.int_value(),
            index,
            sub
        );
        Self {
            response: Some(SdoResponse::abort(index, sub, abort_code)),
            updated_object: None,
            new_state: SdoState::Idle,
        }
    }

    fn response(response: SdoResponse, new_state: SdoState) -> Self {
        Self {
            response: Some(response),
            updated_object: None,
            new_state,
        }
    }

    fn response_with_update(
        response: SdoResponse,
        index: u16,
        sub: u8,
        new_state: SdoState,
    ) -> Self {
        Self {
            response: Some(response),
            updated_object: Some(ObjectId { index, sub }),
            new_state,
        }
    }
}

#[derive(Clone, Copy)]
struct Segmented {
    object: &'static ODEntry<'static>,
    sub: u8,
    toggle_state: bool,
    segment_counter: u32,
    bytes_in_buffer: Option<u32>,
}

#[derive(Clone, Copy)]
struct DownloadBlock {
    sub: u8,
    last_segment: u8,
    client_supports_crc: bool,
    crc: Crc16Ccitt,
    block_counter: usize,
    object: &'static ODEntry<'static>,
}

/// State of an in-progress block upload
#[derive(Clone, Copy)]
struct UploadBlock {
    object: &'static ODEntry<'static>,
    sub: u8,
    crc_enabled: bool,
    crc: Crc16Ccitt,
    /// Bytes currently staged in the scratch buffer, starting at offset 0
    buf_len: usize,
    /// Number of segments generated from `buf_len` (`ceil(buf_len / 7)`)
    segments_in_subblock: u8,
    /// Segments handed out via `poll_block_upload_segment` so far this sub-block
    sent: u8,
    /// True once a read from the OD returned fewer bytes than requested
    od_finished: bool,
    /// Total bytes read from the OD so far, used as the read offset for the next refill
    total_read: usize,
}

enum SdoState {
    Idle,
    DownloadSegmented(Segmented),
    UploadSegmented(Segmented),
    DownloadBlock(DownloadBlock),
    EndDownloadBlock(DownloadBlock),
    UploadBlock(UploadBlock),
    EndUploadBlock(UploadBlock),
}

impl SdoState {
    fn update(
        &self,
        rx: &SdoReceiver,
        elapsed_us: u32,
        config: &ServerConfig,
        od: &'static [ODEntry<'static>],
        nmt_allows_sdo: bool,
        channel: &CobBinding,
    ) -> SdoResult {
        if !nmt_allows_sdo || !channel.is_valid() {
            // Channel invalid or NMT disallows SDO: force IDLE and drop any pending frame
            // without responding (spec §4.5 step 1).
            rx.take_request();
            return SdoResult::no_response(SdoState::Idle);
        }

        let timeout_us = config.sdo_timeout_us;
        match self {
            SdoState::Idle => Self::idle(od, rx, config),
            SdoState::DownloadSegmented(state) => {
                Self::download_segmented(state, rx, elapsed_us, timeout_us)
            }
            SdoState::UploadSegmented(state) => {
                Self::upload_segmented(state, rx, elapsed_us, timeout_us)
            }
            SdoState::DownloadBlock(state) => {
                Self::download_block(state, rx, elapsed_us, timeout_us)
            }
            SdoState::EndDownloadBlock(state) => {
                Self::end_download_block(state, rx, elapsed_us, timeout_us)
            }
            SdoState::UploadBlock(state) => Self::upload_block(state, rx, elapsed_us, timeout_us),
            SdoState::EndUploadBlock(state) => {
                Self::end_upload_block(state, rx, elapsed_us, timeout_us)
            }
        }
    }

    fn idle(od: &'static [ODEntry<'static>], rx: &SdoReceiver, config: &ServerConfig) -> SdoResult {
        let req = match rx.take_request() {
            Some(req) => req,
            None => return SdoResult::no_response(SdoState::Idle),
        };

        match req {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                let od_entry = match find_object_entry(od, index) {
                    Some(x) => x,
                    None => return SdoResult::abort(index, sub, AbortCode::NoSuchObject),
                };
                let obj = od_entry.data;

                let subinfo = match obj.sub_info(sub) {
                    Ok(s) => s,
                    Err(abort_code) => return SdoResult::abort(index, sub, abort_code),
                };

                if e {
                    if !subinfo.access_type.is_writable() {
                        return SdoResult::abort(index, sub, AbortCode::ReadOnly);
                    }

                    let dl_size = 4 - n as usize;
                    if let Err(abort_code) = validate_download_size(dl_size, &subinfo) {
                        return SdoResult::abort(index, sub, abort_code);
                    }

                    if let Err(abort_code) = obj.write(sub, &data[0..dl_size]) {
                        return SdoResult::abort(index, sub, abort_code);
                    }

                    SdoResult::response_with_update(
                        SdoResponse::download_acknowledge(index, sub),
                        index,
                        sub,
                        SdoState::Idle,
                    )
                } else {
                    if let Err(abort_code) = config.check_segmented_allowed() {
                        return SdoResult::abort(index, sub, abort_code);
                    }
                    if s {
                        let dl_size = u32::from_le_bytes(data) as usize;
                        if let Err(abort_code) = validate_download_size(dl_size, &subinfo) {
                            return SdoResult::abort(index, sub, abort_code);
                        }
                    }

                    let new_state = SdoState::DownloadSegmented(Segmented {
                        object: od_entry,
                        sub,
                        toggle_state: false,
                        segment_counter: 0,
                        bytes_in_buffer: Some(0),
                    });
                    SdoResult::response(SdoResponse::download_acknowledge(index, sub), new_state)
                }
            }
            SdoRequest::InitiateUpload { index, sub } => {
                match find_object_entry(od, index) {
                    Some(od_entry) => Self::start_upload(od_entry, index, sub, rx, config),
                    None => SdoResult::abort(index, sub, AbortCode::NoSuchObject),
                }
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                if let Err(abort_code) = config.check_block_allowed() {
                    return SdoResult::abort(index, sub, abort_code);
                }

                let od_entry = match find_object_entry(od, index) {
                    Some(x) => x,
                    None => return SdoResult::abort(index, sub, AbortCode::NoSuchObject),
                };

                let subinfo = match od_entry.data.sub_info(sub) {
                    Ok(s) => s,
                    Err(abort_code) => return SdoResult::abort(index, sub, abort_code),
                };

                if s {
                    if let Err(abort_code) = validate_download_size(size as usize, &subinfo) {
                        return SdoResult::abort(index, sub, abort_code);
                    }
                }

                rx.begin_block_download(BLKSIZE);
                SdoResult::response(
                    SdoResponse::block_download_acknowledge(true, index, sub, BLKSIZE),
                    SdoState::DownloadBlock(DownloadBlock {
                        object: od_entry,
                        sub,
                        client_supports_crc: cc,
                        block_counter: 0,
                        last_segment: 0,
                        crc: Crc16Ccitt::default(),
                    }),
                )
            }
            SdoRequest::InitiateBlockUpload {
                index,
                sub,
                blksize,
                pst,
            } => {
                if let Err(abort_code) = config.check_block_allowed() {
                    return SdoResult::abort(index, sub, abort_code);
                }

                let od_entry = match find_object_entry(od, index) {
                    Some(x) => x,
                    None => return SdoResult::abort(index, sub, AbortCode::NoSuchObject),
                };
                let obj = od_entry.data;

                let subinfo = match obj.sub_info(sub) {
                    Ok(s) => s,
                    Err(abort_code) => return SdoResult::abort(index, sub, abort_code),
                };
                if !subinfo.access_type.is_readable() {
                    return SdoResult::abort(index, sub, AbortCode::WriteOnly);
                }

                let declared_size = obj.current_size(sub).unwrap_or(0);

                if pst != 0 && declared_size != 0 && declared_size <= pst as usize {
                    // Protocol switch: fall back to segmented/expedited upload.
                    return Self::start_upload(od_entry, index, sub, rx, config);
                }

                // Safety: IDLE implies no block-receive is in progress, so the scratch buffer
                // is exclusively owned by the process context here.
                let buffer = unsafe { rx.buffer_mut() };
                let segments_requested = blksize.clamp(1, BLKSIZE) as usize;
                let read_len = (segments_requested * 7).min(buffer.len());
                let n = match obj.read(sub, 0, &mut buffer[..read_len]) {
                    Ok(n) => n,
                    Err(abort_code) => return SdoResult::abort(index, sub, abort_code),
                };
                let od_finished = n < read_len || (declared_size != 0 && n >= declared_size);

                let cc = true;
                let mut crc = Crc16Ccitt::default();
                if cc {
                    crc.update(&buffer[..n]);
                }

                SdoResult::response(
                    SdoResponse::block_upload_acknowledge(
                        cc,
                        declared_size != 0,
                        index,
                        sub,
                        declared_size as u32,
                    ),
                    SdoState::UploadBlock(UploadBlock {
                        object: od_entry,
                        sub,
                        crc_enabled: cc,
                        crc,
                        buf_len: n,
                        segments_in_subblock: n.div_ceil(7).max(1) as u8,
                        sent: 0,
                        od_finished,
                        total_read: n,
                    }),
                )
            }
            _ => SdoResult::abort(0, 0, AbortCode::InvalidCommandSpecifier),
        }
    }

    /// Shared body of `InitiateUpload` and the block-upload protocol-switch fallback
    fn start_upload(
        od_entry: &'static ODEntry<'static>,
        index: u16,
        sub: u8,
        rx: &SdoReceiver,
        config: &ServerConfig,
    ) -> SdoResult {
        let obj = od_entry.data;

        let subinfo = match obj.sub_info(sub) {
            Ok(s) => s,
            Err(abort_code) => return SdoResult::abort(index, sub, abort_code),
        };
        if !subinfo.access_type.is_readable() {
            return SdoResult::abort(index, sub, AbortCode::WriteOnly);
        }

        // Safety: only reachable from IDLE, so the scratch buffer is exclusively owned here.
        let full_buf = unsafe { rx.buffer_mut() };
        let len = full_buf.len();
        let buf = &mut full_buf[0..len - (len % 7)];
        let read_size = match obj.read(sub, 0, buf) {
            Ok(s) => s,
            Err(abort_code) => return SdoResult::abort(index, sub, abort_code),
        };

        if read_size <= 4 {
            SdoResult::response(
                SdoResponse::expedited_upload(index, sub, &buf[..read_size]),
                SdoState::Idle,
            )
        } else {
            if let Err(abort_code) = config.check_segmented_allowed() {
                return SdoResult::abort(index, sub, abort_code);
            }
            // If read size is less than the buffer length, the read is atomic and the size can be
            // reported up front. If it filled the whole buffer, the object may be larger and the
            // size isn't reported, since another read later could see a different total.
            let ack_size = if read_size == buf.len() {
                None
            } else {
                Some(read_size as u32)
            };
            SdoResult::response(
                SdoResponse::upload_acknowledge(index, sub, ack_size),
                SdoState::UploadSegmented(Segmented {
                    object: od_entry,
                    sub,
                    toggle_state: false,
                    segment_counter: 0,
                    bytes_in_buffer: ack_size,
                }),
            )
        }
    }

    fn download_segmented(
        state: &Segmented,
        rx: &SdoReceiver,
        elapsed_us: u32,
        timeout_us: u32,
    ) -> SdoResult {
        let req = match rx.take_request() {
            Some(req) => req,
            None => {
                let time = rx.increment_timer(elapsed_us);
                if time > timeout_us {
                    return SdoResult::abort(state.object.index, state.sub, AbortCode::SdoTimeout);
                } else {
                    return SdoResult::no_response(SdoState::DownloadSegmented(*state));
                }
            }
        };

        match req {
            SdoRequest::DownloadSegment { t, n, c, data } => {
                if t != state.toggle_state {
                    return SdoResult::abort(
                        state.object.index,
                        state.sub,
                        AbortCode::ToggleNotAlternated,
                    );
                }

                let obj = state.object.data;
                // Safety: only the process context touches the scratch buffer outside of
                // block-receive, and we're not in that state here.
                let buf = unsafe { rx.buffer_mut() };

                let total_offset = state.segment_counter as usize * 7;
                let buffer_offset = total_offset % buf.len();
                let on_first_buffer = total_offset == buffer_offset;
                let segment_size = 7 - n as usize;

                let copy_len = segment_size.min(buf.len() - buffer_offset);
                buf[buffer_offset..buffer_offset + copy_len].copy_from_slice(&data[0..copy_len]);

                let buffer_full = buffer_offset + copy_len == buf.len();
                let more_bytes_in_message = copy_len < segment_size;

                if buffer_full && (!c || more_bytes_in_message) {
                    if on_first_buffer {
                        if let Err(abort_code) = obj.begin_partial(state.sub) {
                            return SdoResult::abort(state.object.index, state.sub, abort_code);
                        }
                    }

                    if let Err(abort_code) = obj.write_partial(state.sub, buf) {
                        return SdoResult::abort(state.object.index, state.sub, abort_code);
                    }

                    if more_bytes_in_message {
                        buf[0..segment_size - copy_len]
                            .copy_from_slice(&data[copy_len..segment_size]);
                    }
                }

                if c {
                    if (buffer_full && more_bytes_in_message) || !on_first_buffer {
                        let result = if more_bytes_in_message {
                            obj.write_partial(state.sub, &buf[0..segment_size - copy_len])
                        } else {
                            obj.write_partial(state.sub, &buf[..buffer_offset + segment_size])
                        };
                        if let Err(abort_code) = result {
                            return SdoResult::abort(state.object.index, state.sub, abort_code);
                        }
                        if let Err(abort_code) = obj.end_partial(state.sub) {
                            return SdoResult::abort(state.object.index, state.sub, abort_code);
                        }
                    } else if let Err(abort_code) =
                        obj.write(state.sub, &buf[0..buffer_offset + segment_size])
                    {
                        return SdoResult::abort(state.object.index, state.sub, abort_code);
                    }

                    SdoResult::response_with_update(
                        SdoResponse::download_segment_acknowledge(state.toggle_state),
                        state.object.index,
                        state.sub,
                        SdoState::Idle,
                    )
                } else {
                    if copy_len < segment_size {
                        buf[0..segment_size - copy_len]
                            .copy_from_slice(&data[copy_len..segment_size]);
                    }
                    let new_state = SdoState::DownloadSegmented(Segmented {
                        toggle_state: !state.toggle_state,
                        segment_counter: state.segment_counter + 1,
                        ..*state
                    });
                    SdoResult::response(
                        SdoResponse::download_segment_acknowledge(state.toggle_state),
                        new_state,
                    )
                }
            }
            SdoRequest::Abort { .. } => SdoResult::no_response(SdoState::Idle),
            _ => SdoResult::abort(
                state.object.index,
                state.sub,
                AbortCode::InvalidCommandSpecifier,
            ),
        }
    }

    fn upload_segmented(
        state: &Segmented,
        rx: &SdoReceiver,
        elapsed_us: u32,
        timeout_us: u32,
    ) -> SdoResult {
        let req = match rx.take_request() {
            Some(req) => req,
            None => {
                let time = rx.increment_timer(elapsed_us);
                if time > timeout_us {
                    return SdoResult::abort(state.object.index, state.sub, AbortCode::SdoTimeout);
                } else {
                    return SdoResult::no_response(SdoState::UploadSegmented(*state));
                }
            }
        };
        match req {
            SdoRequest::ReqUploadSegment { t } => {
                if t != state.toggle_state {
                    return SdoResult::abort(
                        state.object.index,
                        state.sub,
                        AbortCode::ToggleNotAlternated,
                    );
                }

                // Safety: upload holds exclusive mainline use of the scratch buffer.
                let full_buf = unsafe { rx.buffer_mut() };
                let len = full_buf.len();
                let buf = &mut full_buf[0..len - (len % 7)];

                let total_read_offset = state.segment_counter as usize * 7;
                let buf_read_offset = total_read_offset % buf.len();

                let segment_size = if let Some(bytes_in_buffer) = state.bytes_in_buffer {
                    bytes_in_buffer as usize - buf_read_offset
                } else {
                    buf.len() - buf_read_offset
                }
                .min(7);
                let mut msg_buf = [0; 7];
                msg_buf[..segment_size]
                    .copy_from_slice(&buf[buf_read_offset..buf_read_offset + segment_size]);

                let mut c = false;
                let mut bytes_in_buffer = state.bytes_in_buffer;
                if state.bytes_in_buffer.is_none() {
                    if buf_read_offset + segment_size == buf.len() {
                        let read_size = match state
                            .object
                            .data
                            .read(state.sub, total_read_offset + segment_size, buf)
                        {
                            Ok(n) => n,
                            Err(abort_code) => {
                                return SdoResult::abort(state.object.index, state.sub, abort_code)
                            }
                        };
                        if read_size == 0 {
                            c = true;
                        } else if read_size != buf.len() {
                            bytes_in_buffer = Some(read_size as u32)
                        }
                    }
                } else if buf_read_offset + segment_size == bytes_in_buffer.unwrap() as usize {
                    c = true;
                }

                let new_state = if c {
                    SdoState::Idle
                } else {
                    SdoState::UploadSegmented(Segmented {
                        toggle_state: !state.toggle_state,
                        segment_counter: state.segment_counter + 1,
                        bytes_in_buffer,
                        ..*state
                    })
                };

                let response =
                    SdoResponse::upload_segment(state.toggle_state, c, &msg_buf[0..segment_size]);

                SdoResult::response(response, new_state)
            }
            SdoRequest::Abort { .. } => SdoResult::no_response(SdoState::Idle),
            _ => SdoResult::abort(
                state.object.index,
                state.sub,
                AbortCode::InvalidCommandSpecifier,
            ),
        }
    }

    fn download_block(
        state: &DownloadBlock,
        rx: &SdoReceiver,
        elapsed_us: u32,
        timeout_us: u32,
    ) -> SdoResult {
        // Up to 127 block segments arrive back-to-back with no per-segment acknowledgement, so
        // reception is handled by the receiver's fast path; here we just wait for it to signal
        // that a sub-block (or the whole transfer) is complete.
        match rx.state() {
            ReceiverState::Normal => {
                let _ = rx.take_request();
                SdoResult::no_response(SdoState::Idle)
            }
            ReceiverState::BlockReceive => {
                let time = rx.increment_timer(elapsed_us);
                if time > timeout_us {
                    rx.set_state(ReceiverState::Normal);
                    SdoResult::abort(state.object.index, state.sub, AbortCode::SdoTimeout)
                } else {
                    SdoResult::no_response(SdoState::DownloadBlock(*state))
                }
            }
            ReceiverState::BlockCompleted {
                ackseq,
                last_segment,
                complete,
            } => {
                if ackseq != last_segment {
                    rx.restart_block_download(ackseq);
                    SdoResult::response(
                        SdoResponse::confirm_block(ackseq, BLKSIZE),
                        SdoState::DownloadBlock(*state),
                    )
                } else {
                    let new_state = if complete {
                        rx.set_state(ReceiverState::Normal);
                        SdoState::EndDownloadBlock(DownloadBlock {
                            block_counter: state.block_counter + 1,
                            last_segment,
                            ..*state
                        })
                    } else {
                        let write_length = last_segment as usize * 7;
                        // Safety: the block-receive fast path has finished this sub-block, so the
                        // buffer is stable until `begin_block_download` is called below.
                        let buf = unsafe { rx.buffer() };
                        let valid_data = &buf[..write_length];
                        let mut crc = state.crc;
                        crc.update(valid_data);

                        if state.block_counter == 0 {
                            if let Err(abort_code) = state.object.data.begin_partial(state.sub) {
                                rx.set_state(ReceiverState::Normal);
                                return SdoResult::abort(state.object.index, state.sub, abort_code);
                            }
                        }

                        if let Err(abort_code) =
                            state.object.data.write_partial(state.sub, valid_data)
                        {
                            rx.set_state(ReceiverState::Normal);
                            return SdoResult::abort(state.object.index, state.sub, abort_code);
                        }

                        rx.begin_block_download(BLKSIZE);
                        SdoState::DownloadBlock(DownloadBlock {
                            block_counter: state.block_counter + 1,
                            crc,
                            ..*state
                        })
                    };
                    SdoResult::response(SdoResponse::confirm_block(ackseq, BLKSIZE), new_state)
                }
            }
        }
    }

    fn end_download_block(
        state: &DownloadBlock,
        rx: &SdoReceiver,
        elapsed_us: u32,
        timeout_us: u32,
    ) -> SdoResult {
        let req = match rx.take_request() {
            Some(req) => req,
            None => {
                let time = rx.increment_timer(elapsed_us);
                if time > timeout_us {
                    return SdoResult::abort(state.object.index, state.sub, AbortCode::SdoTimeout);
                } else {
                    return SdoResult::no_response(SdoState::EndDownloadBlock(*state));
                }
            }
        };

        match req {
            SdoRequest::EndBlockDownload { n, crc } => {
                // Safety: no sub-block reception is in flight in this state.
                let buf = unsafe { rx.buffer() };

                let write_len = state.last_segment as usize * 7 - n as usize;
                let valid_data = &buf[..write_len];
                let mut crc_acc = state.crc;
                crc_acc.update(valid_data);
                let crc_calc = crc_acc.get();
                if state.client_supports_crc && crc_calc != crc {
                    return SdoResult::abort(state.object.index, state.sub, AbortCode::CrcError);
                }

                let objdata = state.object.data;

                if state.block_counter == 1 {
                    if let Err(abort_code) = objdata.write(state.sub, valid_data) {
                        return SdoResult::abort(state.object.index, state.sub, abort_code);
                    }
                } else {
                    if let Err(abort_code) = objdata.write_partial(state.sub, valid_data) {
                        return SdoResult::abort(state.object.index, state.sub, abort_code);
                    }
                    if let Err(abort_code) = objdata.end_partial(state.sub) {
                        return SdoResult::abort(state.object.index, state.sub, abort_code);
                    }
                }

                SdoResult::response_with_update(
                    SdoResponse::ConfirmBlockDownloadEnd,
                    state.object.index,
                    state.sub,
                    SdoState::Idle,
                )
            }
            SdoRequest::Abort { .. } => SdoResult::no_response(SdoState::Idle),
            _ => SdoResult::abort(
                state.object.index,
                state.sub,
                AbortCode::InvalidCommandSpecifier,
            ),
        }
    }

    fn upload_block(
        state: &UploadBlock,
        rx: &SdoReceiver,
        elapsed_us: u32,
        timeout_us: u32,
    ) -> SdoResult {
        let req = match rx.take_request() {
            Some(req) => req,
            None => {
                let time = rx.increment_timer(elapsed_us);
                if time > timeout_us {
                    return SdoResult::abort(state.object.index, state.sub, AbortCode::SdoTimeout);
                } else {
                    return SdoResult::no_response(SdoState::UploadBlock(*state));
                }
            }
        };

        match req {
            // Signals the server to begin streaming segments; the caller drains them via
            // `poll_block_upload_segment`. No response frame is sent for this request.
            SdoRequest::StartBlockUpload => SdoResult::no_response(SdoState::UploadBlock(*state)),
            SdoRequest::ConfirmBlock { ackseq, blksize: _ } => {
                if ackseq > state.segments_in_subblock {
                    return SdoResult::abort(
                        state.object.index,
                        state.sub,
                        AbortCode::InvalidCommandSpecifier,
                    );
                }

                if ackseq < state.segments_in_subblock {
                    // Client missed some segments; rewind so they get re-sent.
                    let retry_state = UploadBlock {
                        sent: ackseq,
                        ..*state
                    };
                    return SdoResult::no_response(SdoState::UploadBlock(retry_state));
                }

                if state.od_finished {
                    let n = ((7 - state.buf_len % 7) % 7) as u8;
                    let crc = if state.crc_enabled { state.crc.get() } else { 0 };
                    return SdoResult::response_with_update(
                        SdoResponse::block_upload_end(n, crc),
                        state.object.index,
                        state.sub,
                        SdoState::EndUploadBlock(*state),
                    );
                }

                // Safety: block upload never overlaps a block-receive fast path.
                let buffer = unsafe { rx.buffer_mut() };
                let read_len = (BLKSIZE as usize * 7).min(buffer.len());
                let n = match state
                    .object
                    .data
                    .read(state.sub, state.total_read, &mut buffer[..read_len])
                {
                    Ok(n) => n,
                    Err(abort_code) => {
                        return SdoResult::abort(state.object.index, state.sub, abort_code)
                    }
                };
                let mut crc = state.crc;
                if state.crc_enabled {
                    crc.update(&buffer[..n]);
                }

                SdoResult::no_response(SdoState::UploadBlock(UploadBlock {
                    crc,
                    buf_len: n,
                    segments_in_subblock: n.div_ceil(7).max(1) as u8,
                    sent: 0,
                    od_finished: n < read_len,
                    total_read: state.total_read + n,
                    ..*state
                }))
            }
            SdoRequest::Abort { .. } => SdoResult::no_response(SdoState::Idle),
            _ => SdoResult::abort(
                state.object.index,
                state.sub,
                AbortCode::InvalidCommandSpecifier,
            ),
        }
    }

    fn end_upload_block(
        state: &UploadBlock,
        rx: &SdoReceiver,
        elapsed_us: u32,
        timeout_us: u32,
    ) -> SdoResult {
        let req = match rx.take_request() {
            Some(req) => req,
            None => {
                let time = rx.increment_timer(elapsed_us);
                if time > timeout_us {
                    return SdoResult::abort(state.object.index, state.sub, AbortCode::SdoTimeout);
                } else {
                    return SdoResult::no_response(SdoState::EndUploadBlock(*state));
                }
            }
        };

        match req {
            SdoRequest::EndBlockUpload => SdoResult::no_response(SdoState::Idle),
            SdoRequest::Abort { .. } => SdoResult::no_response(SdoState::Idle),
            _ => SdoResult::abort(
                state.object.index,
                state.sub,
                AbortCode::InvalidCommandSpecifier,
            ),
        }
    }
}

/// Implements one SDO server channel
///
/// A single instance tracks one client/server transaction at a time. A node implementing
/// multiple SDO channels instantiates one `SdoServer` per channel.
pub struct SdoServer {
    state: SdoState,
    config: ServerConfig,
}

impl SdoServer {
    /// Create a new, idle SDO server with the given capability configuration
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: SdoState::Idle,
            config,
        }
    }

    /// Handle an incoming request (if any) and advance time by `elapsed_us`
    ///
    /// `nmt_allows_sdo` and `channel` gate the whole call per spec §4.5 step 1: when NMT
    /// disallows SDO communication, or `channel` is currently invalid (either COB-ID has its
    /// high bit set), the server is forced to `IDLE`, any pending request is dropped unanswered,
    /// and no object is touched.
    ///
    /// Returns the response frame to transmit (if any) and the object touched by a just-completed
    /// download, if one finished this call.
    pub fn process(
        &mut self,
        rx: &SdoReceiver,
        elapsed_us: u32,
        od: &'static [ODEntry<'static>],
        nmt_allows_sdo: bool,
        channel: &CobBinding,
    ) -> (Option<SdoResponse>, Option<ObjectId>) {
        let result = self
            .state
            .update(rx, elapsed_us, &self.config, od, nmt_allows_sdo, channel);
        self.state = result.new_state;
        (result.response, result.updated_object)
    }

    /// Classify what the most recent `process()` call accomplished
    ///
    /// Takes the same `Option<SdoResponse>` that call returned, so the caller doesn't have to
    /// re-derive it from internal state.
    pub fn outcome(&self, response: Option<SdoResponse>) -> ProcessOutcome {
        ProcessOutcome::classify(&self.state, response)
    }

    /// True while a block upload is actively streaming segments
    pub fn is_uploading_block(&self) -> bool {
        matches!(self.state, SdoState::UploadBlock(_))
    }

    /// Microseconds until the current transfer times out, or `None` when idle
    ///
    /// Lets the caller schedule its next `process()` call instead of polling on a fixed tick,
    /// per the remaining-time budget the protocol cycle tracks internally.
    pub fn next_deadline_us(&self, rx: &SdoReceiver) -> Option<u32> {
        if matches!(self.state, SdoState::Idle) {
            return None;
        }
        Some(self.config.sdo_timeout_us.saturating_sub(rx.timer()))
    }

    /// Pop the next block-transfer segment to transmit, or `None` if the current sub-block has
    /// been fully handed out and the caller should wait for the client's next acknowledgement
    pub fn poll_block_upload_segment(&mut self, rx: &SdoReceiver) -> Option<BlockSegment> {
        let SdoState::UploadBlock(state) = &mut self.state else {
            return None;
        };
        if state.sent >= state.segments_in_subblock {
            return None;
        }

        // Safety: no block-receive fast path runs concurrently with an upload.
        let buffer = unsafe { rx.buffer() };
        let seg_start = state.sent as usize * 7;
        let seg_end = (seg_start + 7).min(state.buf_len);
        let mut data = [0u8; 7];
        data[..seg_end - seg_start].copy_from_slice(&buffer[seg_start..seg_end]);

        let c = state.od_finished && seg_end == state.buf_len;
        state.sent += 1;
        let seqnum = state.sent;

        Some(BlockSegment { c, seqnum, data })
    }
}

/// Size, in bytes, of the scratch buffer shared by every transfer mode
pub const SDO_BUFFER_SIZE: usize = SDO_BUF_SIZE;

#[cfg(test)]
mod tests {
    extern crate std;
    use std::boxed::Box;
    use std::vec;
    use std::vec::Vec;

    use canopen_common::sdo::AbortCode;

    use crate::binding::CobBinding;
    use crate::config::ServerConfig;
    use crate::od::{AccessType, DataType, ObjectCode, SubInfo};
    use crate::od_fields::{ByteField, ConstField, NullTermByteField, SubObjectAccess};
    use crate::od::{find_object, ProvidesSubObjects};

    use super::*;

    /// A channel bound with both directions valid, for tests that don't exercise gating
    const VALID: CobBinding = CobBinding::new(0x600, 0x580, 0);

    const SUB2_SIZE: usize = 78;
    struct Object1000 {
        sub1: NullTermByteField<1200>,
        sub2: ByteField<SUB2_SIZE>,
    }

    impl ProvidesSubObjects for Object1000 {
        fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
            match sub {
                0 => Some((
                    SubInfo::MAX_SUB_NUMBER,
                    const { &ConstField::new(2u8.to_le_bytes()) },
                )),
                1 => Some((
                    SubInfo {
                        data_type: DataType::VisibleString,
                        access_type: AccessType::ReadWrite,
                        size: self.sub1.len(),
                        rpdo_mappable: false,
                        tpdo_mappable: false,
                        persist: false,
                    },
                    &self.sub1,
                )),
                2 => Some((
                    SubInfo {
                        data_type: DataType::OctetString,
                        access_type: AccessType::ReadWrite,
                        size: self.sub2.len(),
                        rpdo_mappable: false,
                        tpdo_mappable: false,
                        persist: false,
                    },
                    &self.sub2,
                )),
                _ => None,
            }
        }

        fn object_code(&self) -> ObjectCode {
            ObjectCode::Record
        }
    }

    fn test_od() -> &'static [ODEntry<'static>] {
        let object1000 = Box::leak(Box::new(Object1000 {
            sub1: NullTermByteField::new([0; 1200]),
            sub2: ByteField::new([0; SUB2_SIZE]),
        }));
        let list = [ODEntry {
            index: 0x1000,
            data: object1000,
        }];
        Box::leak(Box::new(list))
    }

    #[test]
    fn test_expedited_download() {
        let rx = SdoReceiver::new();
        let mut server = SdoServer::new(ServerConfig::new());
        let od = test_od();

        let msg = SdoRequest::expedited_download(0x1000, 2, &[1, 2, 3]).to_bytes();
        rx.handle_req(&msg);
        let (resp, updated) = server.process(&rx, 0, od, true, &VALID);
        assert_eq!(resp, Some(SdoResponse::download_acknowledge(0x1000, 2)));
        assert_eq!(updated, Some(ObjectId { index: 0x1000, sub: 2 }));
    }

    #[test]
    fn test_segmented_download() {
        let rx = SdoReceiver::new();
        let mut server = SdoServer::new(ServerConfig::new());
        let od = test_od();

        let write_data: Vec<u8> = (0..SUB2_SIZE as u8).collect();
        let mut round_trip = |msg: [u8; 8]| {
            rx.handle_req(&msg);
            server.process(&rx, 0, od, true, &VALID)
        };

        let (resp, updated) =
            round_trip(SdoRequest::initiate_download(0x1000, 2, Some(7)).to_bytes());
        assert_eq!(
            resp,
            Some(SdoResponse::ConfirmDownload {
                index: 0x1000,
                sub: 2
            })
        );
        assert_eq!(None, updated);

        let mut toggle = false;
        let mut sent = 0;
        while sent < write_data.len() {
            let remaining = write_data.len() - sent;
            let n = remaining.min(7);
            let complete = remaining <= 7;
            let (resp, updated) = round_trip(
                SdoRequest::download_segment(toggle, complete, &write_data[sent..sent + n])
                    .to_bytes(),
            );
            assert_eq!(
                resp,
                Some(SdoResponse::ConfirmDownloadSegment { t: toggle })
            );
            if complete {
                assert_eq!(updated, Some(ObjectId { index: 0x1000, sub: 2 }));
            } else {
                assert_eq!(updated, None);
            }
            toggle = !toggle;
            sent += n;
        }

        let obj = find_object(od, 0x1000).unwrap();
        let mut read_buf = vec![0u8; write_data.len()];
        obj.read(2, 0, &mut read_buf).unwrap();
        assert_eq!(write_data, read_buf);
    }

    #[test]
    fn test_block_download_happy_path() {
        let rx = SdoReceiver::new();
        let mut server = SdoServer::new(ServerConfig::new());
        let od = test_od();

        const SIZE: usize = 200;
        let data: Vec<u8> = (0..SIZE).map(|x| (x % 256) as u8).collect();
        let crc = crc16::State::<crc16::XMODEM>::calculate(&data);

        let mut round_trip = |msg: [u8; 8]| {
            rx.handle_req(&msg);
            server.process(&rx, 0, od, true, &VALID)
        };

        let (resp, _) =
            round_trip(SdoRequest::initiate_block_download(0x1000, 1, true, SIZE as u32).to_bytes());
        assert_eq!(
            resp,
            Some(SdoResponse::block_download_acknowledge(true, 0x1000, 1, 127))
        );

        let mut pos = 0;
        let mut seqnum = 0;
        while pos < SIZE {
            let len = (SIZE - pos).min(7);
            let mut chunk = [0u8; 7];
            chunk[..len].copy_from_slice(&data[pos..pos + len]);
            pos += len;
            seqnum += 1;
            let c = pos == SIZE;
            let msg = BlockSegment {
                c,
                seqnum,
                data: chunk,
            }
            .to_bytes();
            let (resp, _) = round_trip(msg);
            if c {
                assert_eq!(resp, Some(SdoResponse::confirm_block(seqnum, 127)));
            }
        }

        let n = ((7 - SIZE % 7) % 7) as u8;
        let (resp, updated) =
            round_trip(SdoRequest::end_block_download(n, crc).to_bytes());
        assert_eq!(resp, Some(SdoResponse::ConfirmBlockDownloadEnd));
        assert_eq!(updated, Some(ObjectId { index: 0x1000, sub: 1 }));

        let obj = find_object(od, 0x1000).unwrap();
        let mut read_buf = vec![0u8; SIZE];
        obj.read(1, 0, &mut read_buf).unwrap();
        assert_eq!(data, read_buf);
    }

    #[test]
    fn test_block_upload_happy_path() {
        let rx = SdoReceiver::new();
        let mut server = SdoServer::new(ServerConfig::new());
        let od = test_od();

        let data: Vec<u8> = (0..SUB2_SIZE as u8).collect();
        find_object(od, 0x1000).unwrap().write(2, &data).unwrap();

        rx.handle_req(
            &SdoRequest::initiate_block_upload(0x1000, 2, 127, 0).to_bytes(),
        );
        let (resp, _) = server.process(&rx, 0, od, true, &VALID);
        match resp {
            Some(SdoResponse::ConfirmBlockUpload { s, size, .. }) => {
                assert!(s);
                assert_eq!(size, SUB2_SIZE as u32);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        rx.handle_req(&SdoRequest::StartBlockUpload.to_bytes());
        let (resp, _) = server.process(&rx, 0, od, true, &VALID);
        assert_eq!(resp, None);
        assert!(server.is_uploading_block());

        let mut segments = Vec::new();
        while let Some(seg) = server.poll_block_upload_segment(&rx) {
            segments.push(seg);
        }
        assert_eq!(segments.len(), SUB2_SIZE.div_ceil(7));
        assert!(segments.last().unwrap().c);

        let last_seqnum = segments.last().unwrap().seqnum;
        rx.handle_req(
            &SdoRequest::ConfirmBlock {
                ackseq: last_seqnum,
                blksize: 127,
            }
            .to_bytes(),
        );
        let (resp, updated) = server.process(&rx, 0, od, true, &VALID);
        assert!(matches!(resp, Some(SdoResponse::BlockUploadEnd { .. })));
        assert_eq!(updated, Some(ObjectId { index: 0x1000, sub: 2 }));

        rx.handle_req(&SdoRequest::EndBlockUpload.to_bytes());
        let (resp, _) = server.process(&rx, 0, od, true, &VALID);
        assert_eq!(resp, None);

        // Reassemble the uploaded bytes from the segments and check they round-trip.
        let mut reassembled = Vec::new();
        for (i, seg) in segments.iter().enumerate() {
            let n = if i + 1 == segments.len() {
                SUB2_SIZE - i * 7
            } else {
                7
            };
            reassembled.extend_from_slice(&seg.data[..n]);
        }
        assert_eq!(reassembled, data);
    }

    #[test]
    fn test_segmented_download_timeout() {
        let rx = SdoReceiver::new();
        let mut server = SdoServer::new(ServerConfig {
            sdo_timeout_us: 1_000,
            ..ServerConfig::new()
        });
        let od = test_od();

        rx.handle_req(&SdoRequest::initiate_download(0x1000, 2, Some(7)).to_bytes());
        server.process(&rx, 0, od, true, &VALID);

        let (resp, _) = server.process(&rx, 2_000, od, true, &VALID);
        assert_eq!(
            resp,
            Some(SdoResponse::abort(0x1000, 2, AbortCode::SdoTimeout))
        );
    }
}
