use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write as IoWrite};

use tempfile::TempDir;

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::wal::{Wal, WalError, WalHeader};

#[derive(Debug, PartialEq, Clone)]
struct Record {
    key: Vec<u8>,
    value: Option<Vec<u8>>,
    seq: u64,
}

impl encoding::Encode for Record {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        self.seq.encode_to(buf)?;
        Ok(())
    }
}

impl encoding::Decode for Record {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = <Option<Vec<u8>>>::decode_from(&buf[offset..])?;
        offset += n;
        let (seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { key, value, seq }, offset))
    }
}

fn collect(wal: &Wal<Record>) -> Result<Vec<Record>, WalError> {
    wal.replay_iter()?.collect()
}

#[test]
fn append_and_replay_round_trips() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("wal-000001.log");
    let wal = Wal::<Record>::open(&path, None).unwrap();

    let records = vec![
        Record { key: b"a".to_vec(), value: Some(b"v1".to_vec()), seq: 1 },
        Record { key: b"b".to_vec(), value: None, seq: 2 },
    ];
    for r in &records {
        wal.append(r).unwrap();
    }

    assert_eq!(collect(&wal).unwrap(), records);
}

#[test]
fn reopen_reads_back_existing_header_and_records() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("wal-000001.log");
    {
        let wal = Wal::<Record>::open(&path, None).unwrap();
        wal.append(&Record { key: b"a".to_vec(), value: Some(b"v1".to_vec()), seq: 1 }).unwrap();
    }

    let wal = Wal::<Record>::open(&path, None).unwrap();
    assert_eq!(wal.wal_seq(), 1);
    assert_eq!(collect(&wal).unwrap().len(), 1);
}

#[test]
fn rejects_path_without_wal_seq_pattern() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("not-a-wal.log");
    let err = Wal::<Record>::open(&path, None).unwrap_err();
    assert!(matches!(err, WalError::Internal(_)));
}

#[test]
fn truncate_clears_records_but_keeps_header() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("wal-000001.log");
    let mut wal = Wal::<Record>::open(&path, None).unwrap();

    wal.append(&Record { key: b"a".to_vec(), value: None, seq: 1 }).unwrap();
    wal.append(&Record { key: b"b".to_vec(), value: None, seq: 2 }).unwrap();
    assert_eq!(collect(&wal).unwrap().len(), 2);

    wal.truncate().unwrap();
    assert!(collect(&wal).unwrap().is_empty());
    assert_eq!(wal.wal_seq(), 1);

    wal.append(&Record { key: b"c".to_vec(), value: None, seq: 3 }).unwrap();
    assert_eq!(collect(&wal).unwrap().len(), 1);
}

#[test]
fn rotate_next_opens_incremented_segment() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("wal-000001.log");
    let mut wal = Wal::<Record>::open(&path, None).unwrap();
    wal.append(&Record { key: b"a".to_vec(), value: None, seq: 1 }).unwrap();

    let next_seq = wal.rotate_next().unwrap();
    assert_eq!(next_seq, 2);
    assert_eq!(wal.wal_seq(), 2);
    assert!(collect(&wal).unwrap().is_empty());
    assert!(tmp.path().join("wal-000002.log").exists());
}

#[test]
fn corrupted_header_checksum_is_detected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("wal-000001.log");
    {
        let _wal = Wal::<Record>::open(&path, None).unwrap();
    }

    let mut f = OpenOptions::new().write(true).open(&path).unwrap();
    f.seek(SeekFrom::Start(2)).unwrap();
    f.write_all(&[0x99]).unwrap();
    f.sync_all().unwrap();

    let err = Wal::<Record>::open(&path, None).unwrap_err();
    assert!(matches!(err, WalError::InvalidHeader(_)));
}

#[test]
fn corrupted_record_length_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("wal-000001.log");
    let wal = Wal::<Record>::open(&path, None).unwrap();
    wal.append(&Record { key: b"a".to_vec(), value: None, seq: 1 }).unwrap();

    let mut f = OpenOptions::new().write(true).open(&path).unwrap();
    f.seek(SeekFrom::Start(WalHeader::HEADER_DISK_SIZE as u64)).unwrap();
    f.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
    f.sync_all().unwrap();

    let err = collect(&wal).unwrap_err();
    assert!(matches!(err, WalError::RecordTooLarge(_)));
}

#[test]
fn corrupted_record_bytes_fail_checksum() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("wal-000001.log");
    let wal = Wal::<Record>::open(&path, None).unwrap();
    wal.append(&Record { key: b"a".to_vec(), value: Some(b"v1".to_vec()), seq: 1 }).unwrap();

    let mut f = OpenOptions::new().write(true).open(&path).unwrap();
    f.seek(SeekFrom::End(-3)).unwrap();
    f.write_all(&[0xAA, 0xBB, 0xCC]).unwrap();
    f.sync_all().unwrap();

    let err = collect(&wal).unwrap_err();
    assert!(matches!(err, WalError::ChecksumMismatch));
}

#[test]
fn partial_replay_stops_at_first_corrupted_record() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("wal-000001.log");
    let wal = Wal::<Record>::open(&path, None).unwrap();

    let records = vec![
        Record { key: b"a".to_vec(), value: None, seq: 1 },
        Record { key: b"b".to_vec(), value: None, seq: 2 },
        Record { key: b"c".to_vec(), value: None, seq: 3 },
    ];
    for r in &records {
        wal.append(r).unwrap();
    }

    let mut f = OpenOptions::new().write(true).open(&path).unwrap();
    f.seek(SeekFrom::End(-2)).unwrap();
    f.write_all(&[0x99, 0x77]).unwrap();
    f.sync_all().unwrap();

    let mut replayed = Vec::new();
    for result in wal.replay_iter().unwrap() {
        match result {
            Ok(r) => replayed.push(r),
            Err(WalError::ChecksumMismatch) => break,
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].seq, 1);
    assert_eq!(replayed[1].seq, 2);
}
