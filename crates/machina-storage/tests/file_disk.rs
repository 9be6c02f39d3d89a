use std::io::Write;

use machina_storage::{DiskError, FileDisk, VirtualDisk};

#[test]
fn file_disk_reads_at_offsets_and_rejects_writes() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let mut content = vec![0u8; 4096];
    content[1024..1028].copy_from_slice(b"BOOT");
    file.write_all(&content).unwrap();
    file.flush().unwrap();

    let mut disk = FileDisk::open(file.path()).unwrap();
    assert_eq!(disk.capacity_bytes(), 4096);

    let mut buf = [0u8; 4];
    disk.read_at(1024, &mut buf).unwrap();
    assert_eq!(&buf, b"BOOT");

    assert_eq!(disk.write_at(0, &[1]), Err(DiskError::ReadOnly));

    let err = disk.read_at(4094, &mut buf).unwrap_err();
    assert!(matches!(err, DiskError::OutOfBounds { .. }));
}
