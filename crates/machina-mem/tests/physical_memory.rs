use machina_mem::{PhysicalMemory, PhysicalMemoryOptions};

#[test]
fn sparse_allocation_only_on_write() {
    let mem =
        PhysicalMemory::with_options(0x10_0000, PhysicalMemoryOptions { chunk_size: 4096 })
            .unwrap();

    assert_eq!(mem.allocated_chunks(), 0);

    let mut buf = [0u8; 16];
    mem.read_bytes(0x2000, &mut buf);
    assert_eq!(buf, [0u8; 16]);
    assert_eq!(mem.allocated_chunks(), 0, "reads must not allocate");

    mem.write_u8(0x2000, 0xAA);
    assert_eq!(mem.allocated_chunks(), 1);

    mem.write_u8(0x2001, 0xBB);
    assert_eq!(mem.allocated_chunks(), 1, "same chunk should not reallocate");

    mem.write_u8(0x3000, 0xCC);
    assert_eq!(mem.allocated_chunks(), 2, "different chunk should allocate");
}

#[test]
fn bulk_write_crosses_chunk_boundary() {
    let mem =
        PhysicalMemory::with_options(0x9000, PhysicalMemoryOptions { chunk_size: 4096 }).unwrap();

    let src: Vec<u8> = (0..64).map(|i| (0xA0 + i) as u8).collect();
    mem.write_bytes(0x0FF0, &src);

    let mut dst = vec![0u8; src.len()];
    mem.read_bytes(0x0FF0, &mut dst);
    assert_eq!(dst, src);
    assert_eq!(mem.allocated_chunks(), 2);
}

#[test]
fn typed_accessors_are_little_endian() {
    let mem = PhysicalMemory::new(0x1000).unwrap();
    mem.write_u32(0x10, 0x1122_3344);
    assert_eq!(mem.read_u8(0x10), 0x44);
    assert_eq!(mem.read_u8(0x13), 0x11);
    assert_eq!(mem.read_u16(0x12), 0x1122);
    mem.write_u64(0x20, 0x0102_0304_0506_0708);
    assert_eq!(mem.read_u64(0x20), 0x0102_0304_0506_0708);
}
