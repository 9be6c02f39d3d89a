use machina_mem::{PhysicalMemory, PhysicalMemoryOptions};
use proptest::prelude::*;

proptest! {
    // Any write followed by a same-width read of the same physical address
    // yields the written value.
    #[test]
    fn write_then_read_roundtrips(addr in 0u64..0xF000, value: u64, width in 0usize..4) {
        let mem = PhysicalMemory::with_options(
            0x1_0000,
            PhysicalMemoryOptions { chunk_size: 4096 },
        ).unwrap();

        match width {
            0 => {
                mem.write_u8(addr, value as u8);
                prop_assert_eq!(mem.read_u8(addr), value as u8);
            }
            1 => {
                mem.write_u16(addr, value as u16);
                prop_assert_eq!(mem.read_u16(addr), value as u16);
            }
            2 => {
                mem.write_u32(addr, value as u32);
                prop_assert_eq!(mem.read_u32(addr), value as u32);
            }
            _ => {
                mem.write_u64(addr, value);
                prop_assert_eq!(mem.read_u64(addr), value);
            }
        }
    }

    // Bulk and byte-at-a-time accesses agree.
    #[test]
    fn bulk_equals_byte_loop(addr in 0u64..0xF000, data in proptest::collection::vec(any::<u8>(), 1..64)) {
        let mem = PhysicalMemory::with_options(
            0x1_0000,
            PhysicalMemoryOptions { chunk_size: 4096 },
        ).unwrap();

        mem.write_bytes(addr, &data);
        for (i, &b) in data.iter().enumerate() {
            prop_assert_eq!(mem.read_u8(addr + i as u64), b);
        }
    }
}
