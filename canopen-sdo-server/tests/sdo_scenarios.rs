//! Black-box wire-level scenarios, driving `SdoServer` purely through its public API
//!
//! Each test feeds raw request bytes to an `SdoReceiver` and checks the exact response
//! the server hands back, mirroring a real client/server exchange on the bus.

use std::sync::Mutex;
use std::vec::Vec;

use canopen_common::crc::crc16_ccitt;
use canopen_common::messages::{CanId, SDO_RESP_BASE};
use canopen_common::sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse};
use canopen_sdo_server::{
    find_object, CobBinding, ConstField, ODEntry, ObjectAccess, ObjectCode, ProcessOutcome,
    ProvidesSubObjects, ScalarField, ServerConfig, SdoReceiver, SdoServer, SubInfo,
    SubObjectAccess,
};

const NODE_ID: u16 = 5;

fn resp_id() -> CanId {
    CanId::std(SDO_RESP_BASE + NODE_ID)
}

/// A channel bound with both directions valid, used by every scenario that isn't specifically
/// exercising the channel-invalid/NMT gate
const VALID: CobBinding = CobBinding::new(0x600, 0x580, NODE_ID as u8);

/// An unbounded byte store, standing in for a Domain-typed object
struct DomainObject {
    data: Mutex<Vec<u8>>,
}

impl DomainObject {
    fn new() -> Self {
        Self {
            data: Mutex::new(Vec::new()),
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl ObjectAccess for DomainObject {
    fn read(&self, _sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        let data = self.data.lock().unwrap();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn read_size(&self, _sub: u8) -> Result<usize, AbortCode> {
        Ok(self.data.lock().unwrap().len())
    }

    fn write(&self, _sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        *self.data.lock().unwrap() = data.to_vec();
        Ok(())
    }

    fn begin_partial(&self, _sub: u8) -> Result<(), AbortCode> {
        self.data.lock().unwrap().clear();
        Ok(())
    }

    fn write_partial(&self, _sub: u8, buf: &[u8]) -> Result<(), AbortCode> {
        self.data.lock().unwrap().extend_from_slice(buf);
        Ok(())
    }

    fn end_partial(&self, _sub: u8) -> Result<(), AbortCode> {
        Ok(())
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Domain
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        if sub == 0 {
            Ok(SubInfo::new_domain().rw_access())
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn max_sub_number(&self) -> u8 {
        0
    }
}

/// A single read-only sub 0, fixed at 0 — used for the abort scenario
struct DeviceType;

impl ProvidesSubObjects for DeviceType {
    fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
        match sub {
            0 => Some((
                SubInfo::MAX_SUB_NUMBER,
                const { &ConstField::new(0u8.to_le_bytes()) },
            )),
            _ => None,
        }
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Var
    }
}

struct WritableByte(ScalarField<u8>);

impl ProvidesSubObjects for WritableByte {
    fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
        match sub {
            1 => Some((SubInfo::new_u8().rw_access(), &self.0)),
            _ => None,
        }
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Record
    }
}

struct ReadableWord(ScalarField<u16>);

impl ProvidesSubObjects for ReadableWord {
    fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
        match sub {
            0 => Some((SubInfo::new_u16().ro_access(), &self.0)),
            _ => None,
        }
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Var
    }
}

struct ReadableDword(ScalarField<u32>);

impl ProvidesSubObjects for ReadableDword {
    fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
        match sub {
            0 => Some((SubInfo::new_u32().ro_access(), &self.0)),
            _ => None,
        }
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Var
    }
}

fn leak_od(entries: Vec<ODEntry<'static>>) -> &'static [ODEntry<'static>] {
    Box::leak(entries.into_boxed_slice())
}

#[test]
fn scenario_1_expedited_write() {
    let target = Box::leak(Box::new(WritableByte(ScalarField::new(0))));
    let od = leak_od(vec![ODEntry {
        index: 0x2100,
        data: target,
    }]);

    let rx = SdoReceiver::new();
    let mut server = SdoServer::new(ServerConfig::new());

    let msg = SdoRequest::expedited_download(0x2100, 1, &[0xAA]).to_bytes();
    assert_eq!(msg, [0x2F, 0x00, 0x21, 0x01, 0xAA, 0x00, 0x00, 0x00]);
    rx.handle_req(&msg);
    let (resp, updated) = server.process(&rx, 0, od, true, &VALID);
    assert_eq!(resp, Some(SdoResponse::download_acknowledge(0x2100, 1)));
    assert_eq!(
        resp.unwrap().to_can_message(resp_id()).data(),
        [0x60, 0x00, 0x21, 0x01, 0x00, 0x00, 0x00, 0x00]
    );
    assert!(updated.is_some());
    assert_eq!(find_object(od, 0x2100).unwrap().read_u8(1).unwrap(), 0xAA);
}

#[test]
fn scenario_2_expedited_read() {
    let target = Box::leak(Box::new(ReadableWord(ScalarField::new(0x1234))));
    let od = leak_od(vec![ODEntry {
        index: 0x2010,
        data: target,
    }]);

    let rx = SdoReceiver::new();
    let mut server = SdoServer::new(ServerConfig::new());

    let msg = SdoRequest::initiate_upload(0x2010, 0).to_bytes();
    assert_eq!(msg, [0x40, 0x10, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00]);
    rx.handle_req(&msg);
    let (resp, _) = server.process(&rx, 0, od, true, &VALID);
    assert_eq!(
        resp.unwrap().to_can_message(resp_id()).data(),
        [0x4B, 0x10, 0x20, 0x00, 0x34, 0x12, 0x00, 0x00]
    );
}

#[test]
fn scenario_3_segmented_download_of_14_bytes() {
    let target = Box::leak(Box::new(DomainObject::new()));
    let od = leak_od(vec![ODEntry {
        index: 0x2130,
        data: target,
    }]);

    let rx = SdoReceiver::new();
    let mut server = SdoServer::new(ServerConfig::new());

    rx.handle_req(&SdoRequest::initiate_download(0x2130, 0, Some(14)).to_bytes());
    let (resp, _) = server.process(&rx, 0, od, true, &VALID);
    assert_eq!(resp, Some(SdoResponse::download_acknowledge(0x2130, 0)));

    let payload: Vec<u8> = (0u8..14).collect();
    rx.handle_req(&SdoRequest::download_segment(false, false, &payload[0..7]).to_bytes());
    let (resp, _) = server.process(&rx, 0, od, true, &VALID);
    assert_eq!(resp, Some(SdoResponse::download_segment_acknowledge(false)));

    rx.handle_req(&SdoRequest::download_segment(true, true, &payload[7..14]).to_bytes());
    let (resp, _) = server.process(&rx, 0, od, true, &VALID);
    assert_eq!(resp, Some(SdoResponse::download_segment_acknowledge(true)));

    assert_eq!(target.snapshot(), payload);
}

#[test]
fn scenario_4_block_download_of_21_bytes_with_crc() {
    let target = Box::leak(Box::new(DomainObject::new()));
    let od = leak_od(vec![ODEntry {
        index: 0x2130,
        data: target,
    }]);

    let rx = SdoReceiver::new();
    let mut server = SdoServer::new(ServerConfig::new());

    rx.handle_req(&SdoRequest::initiate_block_download(0x2130, 0, true, 21).to_bytes());
    let (resp, _) = server.process(&rx, 0, od, true, &VALID);
    assert_eq!(
        resp,
        Some(SdoResponse::block_download_acknowledge(true, 0x2130, 0, 127))
    );

    let payload: Vec<u8> = (0u8..21).collect();
    for (i, chunk) in payload.chunks(7).enumerate() {
        let seqnum = (i + 1) as u8;
        let last = seqnum as usize * 7 >= payload.len();
        let mut data = [0u8; 7];
        data[..chunk.len()].copy_from_slice(chunk);
        let frame = BlockSegment {
            c: last,
            seqnum,
            data,
        }
        .to_bytes();
        rx.handle_req(&frame);
    }
    let (resp, _) = server.process(&rx, 0, od, true, &VALID);
    assert_eq!(resp, Some(SdoResponse::confirm_block(3, 127)));

    let crc = crc16_ccitt(&payload);
    let n = ((7 - payload.len() % 7) % 7) as u8;
    rx.handle_req(&SdoRequest::end_block_download(n, crc).to_bytes());
    let (resp, _) = server.process(&rx, 0, od, true, &VALID);
    assert_eq!(resp, Some(SdoResponse::ConfirmBlockDownloadEnd));
    assert_eq!(target.snapshot(), payload);
}

#[test]
fn scenario_5_block_upload_protocol_switch_to_segmented() {
    let target = Box::leak(Box::new(ReadableDword(ScalarField::new(0x0403_0201))));
    let od = leak_od(vec![ODEntry {
        index: 0x2130,
        data: target,
    }]);

    let rx = SdoReceiver::new();
    let mut server = SdoServer::new(ServerConfig::new());

    // pst = 10 >= declared size of 4, so the server falls back to expedited upload
    rx.handle_req(&SdoRequest::initiate_block_upload(0x2130, 0, 127, 10).to_bytes());
    let (resp, _) = server.process(&rx, 0, od, true, &VALID);
    assert_eq!(
        resp,
        Some(SdoResponse::expedited_upload(0x2130, 0, &[1, 2, 3, 4]))
    );
}

#[test]
fn scenario_6_abort_on_write_to_read_only() {
    let target = Box::leak(Box::new(DeviceType));
    let od = leak_od(vec![ODEntry {
        index: 0x1000,
        data: target,
    }]);

    let rx = SdoReceiver::new();
    let mut server = SdoServer::new(ServerConfig::new());

    let msg = SdoRequest::expedited_download(0x1000, 0, &[1]).to_bytes();
    assert_eq!(msg, [0x2F, 0x00, 0x10, 0x00, 0x01, 0x00, 0x00, 0x00]);
    rx.handle_req(&msg);
    let (resp, _) = server.process(&rx, 0, od, true, &VALID);
    assert_eq!(resp, Some(SdoResponse::abort(0x1000, 0, AbortCode::ReadOnly)));
}

#[test]
fn round_trip_download_then_upload_yields_original_bytes() {
    let target = Box::leak(Box::new(DomainObject::new()));
    let od = leak_od(vec![ODEntry {
        index: 0x2200,
        data: target,
    }]);

    let rx = SdoReceiver::new();
    let mut server = SdoServer::new(ServerConfig::new());

    let payload: Vec<u8> = (0u8..30).collect();
    rx.handle_req(&SdoRequest::initiate_download(0x2200, 0, Some(30)).to_bytes());
    server.process(&rx, 0, od, true, &VALID);
    let mut toggle = false;
    for chunk in payload.chunks(7) {
        let last = chunk.len() < 7;
        rx.handle_req(&SdoRequest::download_segment(toggle, last, chunk).to_bytes());
        server.process(&rx, 0, od, true, &VALID);
        toggle = !toggle;
    }
    assert_eq!(target.snapshot(), payload);

    rx.handle_req(&SdoRequest::initiate_upload(0x2200, 0).to_bytes());
    let (resp, _) = server.process(&rx, 0, od, true, &VALID);
    assert!(matches!(resp, Some(SdoResponse::ConfirmUpload { .. })));

    let mut received = Vec::new();
    let mut toggle = false;
    loop {
        rx.handle_req(&SdoRequest::upload_segment_request(toggle).to_bytes());
        let (resp, _) = server.process(&rx, 0, od, true, &VALID);
        match resp {
            Some(SdoResponse::UploadSegment { c, n, data, .. }) => {
                received.extend_from_slice(&data[0..7 - n as usize]);
                toggle = !toggle;
                if c {
                    break;
                }
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
    assert_eq!(received, payload);
}

#[test]
fn outcome_and_deadline_track_an_in_progress_segmented_download() {
    let target = Box::leak(Box::new(DomainObject::new()));
    let od = leak_od(vec![ODEntry {
        index: 0x2130,
        data: target,
    }]);

    let rx = SdoReceiver::new();
    let mut server = SdoServer::new(ServerConfig::new());
    assert_eq!(server.next_deadline_us(&rx), None);

    rx.handle_req(&SdoRequest::initiate_download(0x2130, 0, Some(14)).to_bytes());
    let (resp, _) = server.process(&rx, 0, od, true, &VALID);
    assert_eq!(server.outcome(resp), ProcessOutcome::ResponseReady);

    // A tick with no new frame, mid-transfer: nothing to report, but a deadline is now ticking.
    let (resp, _) = server.process(&rx, 1, od, true, &VALID);
    assert_eq!(server.outcome(resp), ProcessOutcome::Ok);
    assert!(server.next_deadline_us(&rx).unwrap() < 1_000_000);

    rx.handle_req(&SdoRequest::download_segment(false, false, &(0u8..7).collect::<Vec<_>>()).to_bytes());
    server.process(&rx, 0, od, true, &VALID);
    rx.handle_req(&SdoRequest::download_segment(true, true, &(7u8..14).collect::<Vec<_>>()).to_bytes());
    let (resp, _) = server.process(&rx, 0, od, true, &VALID);
    assert_eq!(server.outcome(resp), ProcessOutcome::ResponseReady);
    assert_eq!(server.next_deadline_us(&rx), None);
}

#[test]
fn timeout_in_segmented_download_emits_sdo_timeout_abort() {
    let target = Box::leak(Box::new(DomainObject::new()));
    let od = leak_od(vec![ODEntry {
        index: 0x2130,
        data: target,
    }]);

    let rx = SdoReceiver::new();
    let mut server = SdoServer::new(ServerConfig {
        sdo_timeout_us: 1_000,
        ..ServerConfig::new()
    });

    rx.handle_req(&SdoRequest::initiate_download(0x2130, 0, Some(14)).to_bytes());
    server.process(&rx, 0, od, true, &VALID);

    let (resp, _) = server.process(&rx, 2_000, od, true, &VALID);
    assert_eq!(
        resp,
        Some(SdoResponse::abort(0x2130, 0, AbortCode::SdoTimeout))
    );
    assert_eq!(server.outcome(resp), ProcessOutcome::EndedWithAbort);
    assert_eq!(server.next_deadline_us(&rx), None);
}

#[test]
fn invalid_channel_forces_idle_and_drops_the_pending_request() {
    let target = Box::leak(Box::new(WritableByte(ScalarField::new(0))));
    let od = leak_od(vec![ODEntry {
        index: 0x2100,
        data: target,
    }]);

    let rx = SdoReceiver::new();
    let mut server = SdoServer::new(ServerConfig::new());
    let invalid_channel = CobBinding::new(0x600 | (1 << 31), 0x580, NODE_ID as u8);

    rx.handle_req(&SdoRequest::expedited_download(0x2100, 1, &[0xAA]).to_bytes());
    let (resp, updated) = server.process(&rx, 0, od, true, &invalid_channel);
    assert_eq!(resp, None);
    assert_eq!(updated, None);
    assert_eq!(server.outcome(resp), ProcessOutcome::Ok);

    // The dropped frame must not resurface once the channel becomes valid again.
    let (resp, updated) = server.process(&rx, 0, od, true, &VALID);
    assert_eq!(resp, None);
    assert_eq!(updated, None);
}

#[test]
fn nmt_disallowing_sdo_forces_idle_and_drops_the_pending_request() {
    let target = Box::leak(Box::new(WritableByte(ScalarField::new(0))));
    let od = leak_od(vec![ODEntry {
        index: 0x2100,
        data: target,
    }]);

    let rx = SdoReceiver::new();
    let mut server = SdoServer::new(ServerConfig::new());

    rx.handle_req(&SdoRequest::expedited_download(0x2100, 1, &[0xAA]).to_bytes());
    let (resp, updated) = server.process(&rx, 0, od, false, &VALID);
    assert_eq!(resp, None);
    assert_eq!(updated, None);

    let (resp, updated) = server.process(&rx, 0, od, true, &VALID);
    assert_eq!(resp, None);
    assert_eq!(updated, None);
}

#[test]
fn block_upload_retransmits_the_subblock_on_a_lower_ackseq() {
    let data: Vec<u8> = (0u8..50).collect();
    let target = Box::leak(Box::new(DomainObject::new()));
    target.write(0, &data).unwrap();
    let od = leak_od(vec![ODEntry {
        index: 0x2130,
        data: target,
    }]);

    let rx = SdoReceiver::new();
    let mut server = SdoServer::new(ServerConfig::new());

    rx.handle_req(&SdoRequest::initiate_block_upload(0x2130, 0, 127, 0).to_bytes());
    server.process(&rx, 0, od, true, &VALID);
    rx.handle_req(&SdoRequest::StartBlockUpload.to_bytes());
    server.process(&rx, 0, od, true, &VALID);

    let mut segments = Vec::new();
    while let Some(seg) = server.poll_block_upload_segment(&rx) {
        segments.push(seg);
    }
    let total_segments = segments.len() as u8;
    assert!(total_segments > 1, "test needs more than one segment to retransmit");

    // Acknowledge fewer segments than were sent: the client claims it only received the first
    // one, so the server must resend starting right after it instead of ending the transfer.
    rx.handle_req(
        &SdoRequest::ConfirmBlock {
            ackseq: 1,
            blksize: 127,
        }
        .to_bytes(),
    );
    let (resp, _) = server.process(&rx, 0, od, true, &VALID);
    assert_eq!(resp, None);
    assert!(server.is_uploading_block());

    let mut resent = Vec::new();
    while let Some(seg) = server.poll_block_upload_segment(&rx) {
        resent.push(seg);
    }
    assert_eq!(resent.len(), (total_segments - 1) as usize);
    assert_eq!(resent[0].seqnum, 2);
    assert_eq!(resent[0].data, segments[1].data);
}

#[test]
fn crc_mismatch_on_end_block_download_is_rejected() {
    let target = Box::leak(Box::new(DomainObject::new()));
    let od = leak_od(vec![ODEntry {
        index: 0x2130,
        data: target,
    }]);

    let rx = SdoReceiver::new();
    let mut server = SdoServer::new(ServerConfig::new());

    rx.handle_req(&SdoRequest::initiate_block_download(0x2130, 0, true, 21).to_bytes());
    server.process(&rx, 0, od, true, &VALID);

    let payload: Vec<u8> = (0u8..21).collect();
    for (i, chunk) in payload.chunks(7).enumerate() {
        let seqnum = (i + 1) as u8;
        let last = seqnum as usize * 7 >= payload.len();
        let mut data = [0u8; 7];
        data[..chunk.len()].copy_from_slice(chunk);
        rx.handle_req(&BlockSegment { c: last, seqnum, data }.to_bytes());
    }
    server.process(&rx, 0, od, true, &VALID);

    let n = ((7 - payload.len() % 7) % 7) as u8;
    let wrong_crc = crc16_ccitt(&payload).wrapping_add(1);
    rx.handle_req(&SdoRequest::end_block_download(n, wrong_crc).to_bytes());
    let (resp, updated) = server.process(&rx, 0, od, true, &VALID);
    assert_eq!(
        resp,
        Some(SdoResponse::abort(0x2130, 0, AbortCode::CrcError))
    );
    assert_eq!(updated, None);
}
