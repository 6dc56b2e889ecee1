use std::io::Write as _;

use piix_storage::{ByteRange, FileMedium, HostMedium, MediumError};

fn medium_with_len(len: u64) -> FileMedium {
    let file = tempfile::tempfile().unwrap();
    file.set_len(len).unwrap();
    FileMedium::from_file(file).unwrap()
}

#[test]
fn file_medium_write_read_roundtrip() {
    let medium = medium_with_len(4096);
    assert_eq!(medium.capacity_bytes(), 4096);

    let data = b"hello file medium";
    medium.write_at(123, data).unwrap();

    let mut back = vec![0u8; data.len()];
    medium.read_at(123, &mut back).unwrap();
    assert_eq!(back, data);
    medium.flush().unwrap();
}

#[test]
fn file_medium_does_not_grow_past_capacity() {
    let medium = medium_with_len(1024);

    let err = medium.write_at(1000, &[0u8; 100]).unwrap_err();
    assert!(matches!(err, MediumError::OutOfBounds { .. }));

    let mut buf = [0u8; 200];
    let err = medium.read_at(900, &mut buf).unwrap_err();
    assert!(matches!(err, MediumError::OutOfBounds { .. }));
}

#[test]
fn file_medium_discard_zeroes_range() {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&[0xA5u8; 2048]).unwrap();
    let medium = FileMedium::from_file(file).unwrap();

    medium
        .discard(&[ByteRange {
            offset: 512,
            len: 512,
        }])
        .unwrap();

    let mut back = vec![0u8; 2048];
    medium.read_at(0, &mut back).unwrap();
    assert!(back[..512].iter().all(|b| *b == 0xA5));
    assert!(back[512..1024].iter().all(|b| *b == 0));
    assert!(back[1024..].iter().all(|b| *b == 0xA5));
}

#[test]
fn read_only_file_medium_rejects_writes() {
    let medium = medium_with_len(512).read_only(true);
    assert!(matches!(
        medium.write_at(0, &[1]).unwrap_err(),
        MediumError::ReadOnly
    ));
}
