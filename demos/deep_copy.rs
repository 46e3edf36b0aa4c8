use omp_dc_rs::omptarget::KernelArg;
use omp_dc_rs::rtt::{MapType, RootArgument, RttCode, TypeDescriptor};
use omp_dc_rs::{Config, LoopbackBackend, MappingMode, RuntimeState};
use std::sync::Arc;

const WORD: usize = std::mem::size_of::<usize>();
const ROWS: usize = 4;
const COLS: usize = 8;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Deep Copy Demo: double** matrix ===");

    let mode = if std::env::args().any(|a| a == "--bulk") {
        MappingMode::Bulk
    } else {
        MappingMode::Direct
    };
    let backend = Arc::new(LoopbackBackend::new(1));
    let rt = RuntimeState::new(Config::default().with_mode(mode), backend.clone(), 1)?;
    let dev = rt.device(0)?;
    println!("[+] Device 0 ready in {} mode", mode.name());

    // 1. Host matrix: an array of row pointers
    let mut rows: Vec<Vec<f64>> = (0..ROWS)
        .map(|r| (0..COLS).map(|c| (r * COLS + c) as f64).collect())
        .collect();
    let mut row_ptrs: Vec<usize> = rows.iter_mut().map(|r| r.as_mut_ptr() as usize).collect();
    let base = row_ptrs.as_mut_ptr() as usize;

    // 2. Descriptor: pointer to an array of pointers to doubles
    let desc = TypeDescriptor::new(
        vec![RttCode::TID | 1, RttCode::PTR, RttCode::PTR, RttCode::BUILTIN],
        vec![ROWS * WORD, COLS * 8],
    )?;
    let root = RootArgument {
        begin: base,
        base,
        size: ROWS * WORD,
        map_type: MapType::TO | MapType::FROM | MapType::NESTED | MapType::TARGET_PARAM,
    };

    // 3. Map everything reachable, then patch the row pointers on the device
    // SAFETY: the matrix outlives the mapping.
    unsafe { rt.map_nested(0, &desc, root)? };
    // SAFETY: as above.
    let patched = unsafe { dev.end_phase()? };
    println!("[+] Mapped {} rows, patched {patched} pointers", ROWS);

    let dev_base = dev.translate(base, ROWS * WORD)?.ok_or("matrix not mapped")?;
    for r in 0..ROWS {
        let field = backend.peek_word(0, dev_base + r * WORD)?;
        println!("    row {r}: host {:#x} -> device {field:#x}", row_ptrs[r]);
    }

    // 4. "Kernel": negate every element on the device
    dev.run_region(0x1, &[KernelArg::Pointer { addr: base, size: ROWS * WORD }], &[0])?;
    for r in 0..ROWS {
        let row_dev = backend.peek_word(0, dev_base + r * WORD)?;
        for c in 0..COLS {
            let addr = row_dev + c * 8;
            let bytes: [u8; 8] = backend.peek(0, addr, 8)?.as_slice().try_into()?;
            backend.poke(0, addr, &(-f64::from_ne_bytes(bytes)).to_ne_bytes())?;
        }
    }

    // 5. Unmap: data comes back, host row pointers stay host pointers
    // SAFETY: as above.
    unsafe { rt.unmap_nested(0, &desc, root)? };
    for (r, row) in rows.iter().enumerate() {
        assert_eq!(row_ptrs[r], row.as_ptr() as usize);
        println!("    row {r}: {:?}", row);
    }

    println!("=== Done ({:?}) ===", backend.stats(0)?);
    Ok(())
}
