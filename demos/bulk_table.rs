use omp_dc_rs::omptarget::segment::{TableEntry, device_lookup};
use omp_dc_rs::rtt::MapType;
use omp_dc_rs::{Config, LoopbackBackend, MappingMode, RuntimeState};
use std::sync::Arc;

const WORD: usize = std::mem::size_of::<usize>();

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Bulk Transfer / Translation Table Demo ===");

    // 1. Runtime in address-translate mode over one simulated device
    let backend = Arc::new(LoopbackBackend::new(1));
    let config = Config::default()
        .with_mode(MappingMode::AddressTranslate)
        .with_page_threshold(256);
    let rt = RuntimeState::new(config, backend.clone(), 1)?;
    let dev = rt.device(0)?;
    println!("[+] Device 0 ready, address translation: {}", dev.address_translate_enabled());

    // 2. Map three host arrays. Two sit close enough to merge into one segment.
    let a = vec![1u32; 64];
    let b = vec![2u32; 64];
    let far = vec![3u64; 4096];
    for (name, ptr, bytes) in [
        ("a", a.as_ptr() as usize, 64 * 4),
        ("b", b.as_ptr() as usize, 64 * 4),
        ("far", far.as_ptr() as usize, 4096 * 8),
    ] {
        // SAFETY: the vectors outlive every transfer below.
        unsafe { dev.map_region(ptr, ptr, bytes, MapType::TO | MapType::FROM)? };
        println!("    mapped {name:>3} at {ptr:#x} ({bytes} bytes)");
    }

    // 3. End the phase: segments are backed, filled, and the table is sent
    // SAFETY: as above.
    unsafe { dev.end_phase()? };
    let args = dev.table_args();
    println!("[+] Table at {:#x}, {} rows (header included)", args.table, args.table_size);

    // 4. Read the table back the way a kernel would see it
    let raw = backend.peek(0, args.table, args.table_size * TableEntry::SIZE)?;
    let words: Vec<usize> = raw
        .chunks_exact(WORD)
        .map(|w| {
            let mut buf = [0u8; WORD];
            buf.copy_from_slice(w);
            usize::from_ne_bytes(buf)
        })
        .collect();
    let table: Vec<TableEntry> = words
        .chunks_exact(3)
        .map(|r| TableEntry {
            host_begin: r[0],
            host_end: r[1],
            device_begin: r[2],
        })
        .collect();
    for row in &table[1..] {
        println!(
            "    [{:#x}, {:#x}) -> {:#x}",
            row.host_begin, row.host_end, row.device_begin
        );
    }

    // 5. The device-side lookup agrees with the host
    for probe in [a.as_ptr() as usize + 8, b.as_ptr() as usize, far.as_ptr() as usize + 100] {
        let kernel = device_lookup(&table, probe);
        let host = dev.translate(probe, 1)?;
        println!("    {probe:#x}: kernel {kernel:x?}, host {host:x?}");
        assert_eq!(kernel, host);
    }

    println!("=== Done ({:?}) ===", backend.stats(0)?);
    Ok(())
}
