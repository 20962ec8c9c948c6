//! `.idata` import directory, import address table, and hint/name table
//! construction.
//!
//! Layout, in file order: the Import Directory Table (one 20-byte
//! `IMAGE_IMPORT_DESCRIPTOR` per DLL plus a zeroed terminator), the Import
//! Address Table (one 4-byte slot per symbol per DLL, zero-terminated per
//! DLL), then a names block (a 2-byte hint + null-terminated name per
//! symbol, 2-aligned, followed by each DLL's own null-terminated name).

use crate::bytes::ByteWriter;

/// A single imported library and the ordered list of symbols pulled from it.
#[derive(Debug, Clone)]
pub struct ImportEntry {
    pub library: String,
    pub symbols: Vec<String>,
}

impl ImportEntry {
    /// The default build's single import: `kernel32.dll` with exactly the
    /// twelve symbols the generated `.text` references at fixed addresses
    /// `0x00401028 + i*4`.
    pub fn kernel32_default() -> ImportEntry {
        ImportEntry {
            library: "kernel32.dll".to_string(),
            symbols: vec![
                "ExitProcess",
                "GetLastError",
                "LoadLibraryExA",
                "GetProcAddress",
                "FreeLibrary",
                "GetStdHandle",
                "ReadFile",
                "WriteFile",
                "OutputDebugStringA",
                "HeapAlloc",
                "GetProcessHeap",
                "HeapFree",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

/// The built `.idata` section content plus the RVAs downstream consumers
/// (the assembly emitter's fixed import addresses, the PE data directory)
/// need to reference into it.
pub struct Idata {
    pub content: Vec<u8>,
    /// RVA of the first DLL's Import Address Table -- the base the
    /// generated code's fixed `0x00401028 + i*4` addresses resolve against
    /// once the image is based at `0x400000`.
    pub iat_rva: u32,
}

const DESCRIPTOR_SIZE: u32 = 20;

/// Builds the full `.idata` content for `entries`, given the section's
/// final RVA (`idata_rva`) -- known before this runs because `.idata` is
/// always the first section in the fixed layout.
pub fn build_idata(entries: &[ImportEntry], idata_rva: u32) -> Idata {
    let descriptor_table_size = DESCRIPTOR_SIZE * (entries.len() as u32 + 1);

    let iat_sizes: Vec<u32> = entries
        .iter()
        .map(|e| 4 * (e.symbols.len() as u32 + 1))
        .collect();
    let iat_total: u32 = iat_sizes.iter().sum();
    let iat_rva = idata_rva + descriptor_table_size;

    let names_rva = iat_rva + iat_total;

    // Lay out the names block first so descriptor/IAT entries can reference
    // it by RVA: a 2-byte hint + null-terminated name per symbol (2-aligned),
    // then each DLL's own null-terminated name.
    let mut names = ByteWriter::new();
    let mut symbol_name_rva: Vec<Vec<u32>> = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut rvas = Vec::with_capacity(entry.symbols.len());
        for sym in &entry.symbols {
            rvas.push(names_rva + names.position() as u32);
            names.u16(0); // hint
            for b in sym.bytes() {
                names.u8(b);
            }
            names.u8(0);
            names.align_to(2);
        }
        symbol_name_rva.push(rvas);
    }
    let mut library_name_rva = Vec::with_capacity(entries.len());
    for entry in entries {
        library_name_rva.push(names_rva + names.position() as u32);
        for b in entry.library.bytes() {
            names.u8(b);
        }
        names.u8(0);
    }

    let mut iat = ByteWriter::new();
    let mut dll_iat_rva = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        dll_iat_rva.push(iat_rva + iat.position() as u32);
        for &rva in &symbol_name_rva[i] {
            iat.u32(rva);
        }
        iat.u32(0);
    }

    let mut table = ByteWriter::new();
    for (i, entry) in entries.iter().enumerate() {
        table.u32(0); // OriginalFirstThunk -- zero is permitted (Delphi convention)
        table.u32(0); // TimeDateStamp
        table.u32(0); // ForwarderChain
        table.u32(library_name_rva[i]);
        table.u32(dll_iat_rva[i]);
        let _ = entry;
    }
    table.u32(0);
    table.u32(0);
    table.u32(0);
    table.u32(0);
    table.u32(0);

    let mut content = table.into_vec();
    content.extend_from_slice(iat.as_slice());
    content.extend_from_slice(names.as_slice());

    Idata {
        content,
        iat_rva: dll_iat_rva.first().copied().unwrap_or(iat_rva),
    }
}
