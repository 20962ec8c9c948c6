//! PE32 image layout and serialisation: DOS header and stub,
//! COFF file header, PE32 optional header with its 16 data directories,
//! the section header table, and the four fixed section bodies in file
//! order `.idata`, `.bss`, `.text`, `.rsrc`.
//!
//! Sections are laid out sequentially because each one's RVA must be known
//! before its own content can reference it (`.idata`'s internal name-table
//! RVAs, `.rsrc`'s `DataRVA` fields) -- so the writer never backfills a
//! section's RVA after the fact, it only ever consumes RVAs already fixed
//! by an earlier section in the list.

use tracing::debug;

use crate::bytes::{align_up, ByteWriter};
use crate::import::{build_idata, ImportEntry};
use crate::resource::{build_rsrc, default_resource_tree, VersionInfo};
use crate::section::{
    Section, BSS_CHARACTERISTICS, BSS_VIRTUAL_SIZE, IDATA_CHARACTERISTICS, RSRC_CHARACTERISTICS,
    TEXT_CHARACTERISTICS,
};
use crate::PeError;

const IMAGE_BASE: u32 = 0x0040_0000;
const SECTION_ALIGNMENT: u32 = 0x1000;
const FILE_ALIGNMENT: u32 = 0x200;
const DOS_HEADER_SIZE: usize = 64;
const COFF_HEADER_SIZE: usize = 20;
const OPTIONAL_HEADER_SIZE: usize = 224; // 96 fixed fields + 16 * 8-byte data directories
const SECTION_HEADER_SIZE: usize = 40;
const NUM_DATA_DIRECTORIES: u16 = 16;
const IMAGE_FILE_MACHINE_I386: u16 = 0x014C;
const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x010B;
const IMAGE_SUBSYSTEM_WINDOWS_CUI: u16 = 3;

/// The classic "This program cannot be run in DOS mode." real-mode stub.
/// Prints the message via `int 0x10` teletype output and exits via
/// `int 0x21, ax=0x4C01`, rather than the historically-common `int 0x21,
/// ah=0x09` string-print call -- an equally valid, just less common, DOS
/// stub convention.
fn dos_stub() -> Vec<u8> {
    const MESSAGE: &[u8] = b"This program cannot be run in DOS mode.\r\r\n$";
    let mut code = vec![
        0xB4, 0x13, // mov ah, 0x13
        0xB0, 0x01, // mov al, 1
        0xBB, 0x0C, 0x00, // mov bx, 0x000C
    ];
    code.push(0xB9);
    code.extend_from_slice(&(MESSAGE.len() as u16).to_le_bytes()); // mov cx, len
    code.extend_from_slice(&[0xBA, 0x00, 0x00]); // mov dx, 0
    code.push(0x0E); // push cs
    code.push(0x07); // pop es
    code.extend_from_slice(&[0xBD, 0x19, 0x00]); // mov bp, 0x19
    code.extend_from_slice(&[0xCD, 0x10]); // int 0x10
    code.extend_from_slice(&[0xB8, 0x01, 0x4C]); // mov ax, 0x4C01
    code.extend_from_slice(&[0xCD, 0x21]); // int 0x21
    debug_assert_eq!(code.len(), 0x19);
    code.extend_from_slice(MESSAGE);
    code
}

/// Which DOS-header/stub variant to emit. `Ape` shrinks nothing structurally
/// but is kept distinct because an APE (Actually Portable Executable)
/// build additionally needs to stay a byte-identical prefix of a POSIX
/// shell script, which constrains later stub-region edits outside this
/// writer's scope -- recorded here only as the selector, not yet acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeVariant {
    Standard,
    Ape,
}

/// Everything the writer needs beyond the raw `.text` bytes: the import
/// table contents and the version-resource metadata to embed.
pub struct PeInput {
    pub variant: PeVariant,
    pub code: Vec<u8>,
    pub entry_symbol_offset: u32,
    pub imports: Vec<ImportEntry>,
    pub version_info: VersionInfo,
}

impl Default for PeInput {
    fn default() -> PeInput {
        PeInput {
            variant: PeVariant::Standard,
            code: Vec::new(),
            entry_symbol_offset: 0,
            imports: vec![ImportEntry::kernel32_default()],
            version_info: VersionInfo::default(),
        }
    }
}

/// Builds the complete PE32 image bytes for `input`.
pub fn write_pe(input: &PeInput) -> Result<Vec<u8>, PeError> {
    let stub = dos_stub();
    let dos_header_total = DOS_HEADER_SIZE + stub.len();
    let e_lfanew = align_up(dos_header_total as u32, 8);

    let header_block_size = e_lfanew as usize + 4 + COFF_HEADER_SIZE + OPTIONAL_HEADER_SIZE + 4 * SECTION_HEADER_SIZE;
    let headers_file_size = align_up(header_block_size as u32, FILE_ALIGNMENT);

    // .idata is always first so its RVA is fixed before its content (which
    // references itself internally) is built.
    let idata_rva = SECTION_ALIGNMENT;
    let idata_built = build_idata(&input.imports, idata_rva);
    let idata_content_len = idata_built.content.len() as u32;
    let idata_virtual_size = align_up(idata_content_len, SECTION_ALIGNMENT).max(SECTION_ALIGNMENT);

    let bss_rva = idata_rva + idata_virtual_size;
    let bss_virtual_size = align_up(BSS_VIRTUAL_SIZE, SECTION_ALIGNMENT);

    let text_rva = bss_rva + bss_virtual_size;
    let text_virtual_size = align_up(input.code.len().max(1) as u32, SECTION_ALIGNMENT);

    let rsrc_rva = text_rva + text_virtual_size;
    let rsrc_content = build_rsrc(default_resource_tree(&input.version_info), rsrc_rva);
    let rsrc_content_len = rsrc_content.len() as u32;
    let rsrc_virtual_size = align_up(rsrc_content_len, SECTION_ALIGNMENT).max(SECTION_ALIGNMENT);

    if rsrc_content.len() > 4096 {
        return Err(PeError::ResourceBudgetExceeded { size: rsrc_content.len() });
    }

    let mut file_cursor = headers_file_size;
    let mut sections = Vec::with_capacity(4);

    let idata_file_offset = file_cursor;
    file_cursor += align_up(idata_built.content.len() as u32, FILE_ALIGNMENT);
    sections.push(Section {
        name: ".idata".to_string(),
        characteristics: IDATA_CHARACTERISTICS,
        rva: idata_rva,
        virtual_size: idata_built.content.len() as u32,
        file_offset: Some(idata_file_offset),
        data: idata_built.content,
    });

    sections.push(Section {
        name: ".bss".to_string(),
        characteristics: BSS_CHARACTERISTICS,
        rva: bss_rva,
        virtual_size: BSS_VIRTUAL_SIZE,
        file_offset: None,
        data: Vec::new(),
    });

    let text_file_offset = file_cursor;
    file_cursor += align_up(input.code.len() as u32, FILE_ALIGNMENT);
    sections.push(Section {
        name: ".text".to_string(),
        characteristics: TEXT_CHARACTERISTICS,
        rva: text_rva,
        virtual_size: input.code.len() as u32,
        file_offset: Some(text_file_offset),
        data: input.code.clone(),
    });

    let rsrc_file_offset = file_cursor;
    file_cursor += align_up(rsrc_content.len() as u32, FILE_ALIGNMENT);
    sections.push(Section {
        name: ".rsrc".to_string(),
        characteristics: RSRC_CHARACTERISTICS,
        rva: rsrc_rva,
        virtual_size: rsrc_content.len() as u32,
        file_offset: Some(rsrc_file_offset),
        data: rsrc_content,
    });

    let image_size = align_up(rsrc_rva + rsrc_virtual_size, SECTION_ALIGNMENT);
    debug!(image_size, headers_file_size, sections = sections.len(), "laid out PE sections");

    let mut w = ByteWriter::new();
    write_dos_header(&mut w, &stub, e_lfanew);
    w.pad_to(e_lfanew as usize);
    write_pe_header_and_sections(&mut w, &sections, image_size, headers_file_size, text_rva, input.entry_symbol_offset, idata_rva, idata_content_len, rsrc_rva, rsrc_content_len)?;
    w.pad_to(headers_file_size as usize);

    for section in &sections {
        if let Some(offset) = section.file_offset {
            if w.position() != offset as usize {
                return Err(PeError::SectionOffsetMismatch {
                    name: section.name.clone(),
                    expected: offset,
                    actual: w.position() as u32,
                });
            }
            w.bytes(&section.data);
            w.pad_to(align_up(w.position() as u32, FILE_ALIGNMENT) as usize);
        }
    }

    Ok(w.into_vec())
}

fn write_dos_header(w: &mut ByteWriter, stub: &[u8], e_lfanew: u32) {
    let dos_header_total = DOS_HEADER_SIZE as u32 + stub.len() as u32;
    let e_cp = (dos_header_total + 511) / 512;
    let e_cblp = dos_header_total % 512;

    w.u16(0x5A4D); // e_magic "MZ"
    w.u16(e_cblp as u16); // e_cblp: bytes on the last page
    w.u16(e_cp as u16); // e_cp: page count
    w.u16(0x0000); // e_crlc
    w.u16(0x0004); // e_cparhdr
    w.u16(0x0000); // e_minalloc
    w.u16(0xFFFF); // e_maxalloc
    w.u16(0x0000); // e_ss
    w.u16(0x00B8); // e_sp
    w.u16(0x0000); // e_csum
    w.u16(0x0000); // e_ip
    w.u16(0x0000); // e_cs
    w.u16(0x0040); // e_lfarlc
    w.u16(0x0000); // e_ovno
    for _ in 0..4 {
        w.u16(0); // e_res
    }
    w.u16(0x0000); // e_oemid
    w.u16(0x0000); // e_oeminfo
    for _ in 0..10 {
        w.u16(0); // e_res2
    }
    w.u32(e_lfanew); // e_lfanew
    w.bytes(stub);
}

#[allow(clippy::too_many_arguments)]
fn write_pe_header_and_sections(
    w: &mut ByteWriter,
    sections: &[Section],
    image_size: u32,
    headers_file_size: u32,
    text_rva: u32,
    entry_symbol_offset: u32,
    idata_rva: u32,
    idata_size: u32,
    rsrc_rva: u32,
    rsrc_size: u32,
) -> Result<(), PeError> {
    w.u32(0x0000_4550); // "PE\0\0"

    // COFF file header
    w.u16(IMAGE_FILE_MACHINE_I386);
    w.u16(sections.len() as u16);
    w.u32(0); // TimeDateStamp
    w.u32(0); // PointerToSymbolTable
    w.u32(0); // NumberOfSymbols
    w.u16(OPTIONAL_HEADER_SIZE as u16);
    w.u16(0x0103); // Characteristics: RELOCS_STRIPPED | EXECUTABLE_IMAGE | 32BIT_MACHINE

    // PE32 optional header
    w.u16(IMAGE_NT_OPTIONAL_HDR32_MAGIC);
    w.u8(1); // MajorLinkerVersion
    w.u8(0); // MinorLinkerVersion
    let text_size = sections
        .iter()
        .find(|s| s.name == ".text")
        .map(Section::raw_size)
        .unwrap_or(0);
    w.u32(align_up(text_size, FILE_ALIGNMENT)); // SizeOfCode
    let idata_size_aligned = align_up(idata_size, FILE_ALIGNMENT);
    let rsrc_size_aligned = align_up(rsrc_size, FILE_ALIGNMENT);
    w.u32(idata_size_aligned + rsrc_size_aligned); // SizeOfInitializedData
    w.u32(BSS_VIRTUAL_SIZE); // SizeOfUninitializedData
    w.u32(text_rva + entry_symbol_offset); // AddressOfEntryPoint
    w.u32(text_rva); // BaseOfCode
    w.u32(idata_rva); // BaseOfData
    w.u32(IMAGE_BASE);
    w.u32(SECTION_ALIGNMENT);
    w.u32(FILE_ALIGNMENT);
    w.u16(3); // MajorOSVersion
    w.u16(10); // MinorOSVersion
    w.u16(0); // MajorImageVersion
    w.u16(0);
    w.u16(3); // MajorSubsystemVersion
    w.u16(10); // MinorSubsystemVersion
    w.u32(0); // Win32VersionValue
    w.u32(image_size);
    w.u32(headers_file_size);
    w.u32(0); // CheckSum
    w.u16(IMAGE_SUBSYSTEM_WINDOWS_CUI);
    w.u16(0x0000); // DllCharacteristics (stack/heap fixed and small; nothing opted in)
    w.u32(0x0010_0000); // SizeOfStackReserve
    w.u32(0x0000_1000); // SizeOfStackCommit
    w.u32(0x0010_0000); // SizeOfHeapReserve
    w.u32(0x0000_1000); // SizeOfHeapCommit
    w.u32(0); // LoaderFlags
    w.u32(NUM_DATA_DIRECTORIES as u32);

    // Data directories: Export(0), Import(1), Resource(2), Exception(3),
    // Security(4), BaseReloc(5), Debug(6), Architecture(7), GlobalPtr(8),
    // TLS(9), LoadConfig(10), BoundImport(11), IAT(12), DelayImport(13),
    // CLRRuntimeHeader(14), Reserved(15).
    w.u32(0);
    w.u32(0); // Export
    w.u32(idata_rva);
    w.u32(idata_size); // Import
    w.u32(rsrc_rva);
    w.u32(rsrc_size); // Resource
    for _ in 0..13 {
        w.u32(0);
        w.u32(0);
    }

    for section in sections {
        w.padded_str(&section.name, 8);
        w.u32(section.virtual_size);
        w.u32(section.rva);
        w.u32(align_up(section.raw_size(), FILE_ALIGNMENT));
        w.u32(section.file_offset.unwrap_or(0));
        w.u32(0); // PointerToRelocations
        w.u32(0); // PointerToLinenumbers
        w.u16(0); // NumberOfRelocations
        w.u16(0); // NumberOfLinenumbers
        w.u32(section.characteristics);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dos_stub_message_offset_and_length_match_spec() {
        let stub = dos_stub();
        assert_eq!(stub[0x19], b'T');
        assert_eq!(stub.len(), 0x19 + 43);
    }

    #[test]
    fn write_pe_produces_mz_and_pe_signatures() {
        let image = write_pe(&PeInput {
            code: vec![0x90, 0xC3],
            ..PeInput::default()
        })
        .expect("layout is internally consistent");
        assert_eq!(&image[0..2], b"MZ");
        let e_lfanew = u32::from_le_bytes(image[0x3C..0x40].try_into().unwrap()) as usize;
        assert_eq!(&image[e_lfanew..e_lfanew + 4], b"PE\0\0");
    }

    #[test]
    fn section_count_is_four_in_fixed_order() {
        let image = write_pe(&PeInput::default()).expect("default input lays out cleanly");
        let e_lfanew = u32::from_le_bytes(image[0x3C..0x40].try_into().unwrap()) as usize;
        let coff = e_lfanew + 4;
        let n_sections = u16::from_le_bytes(image[coff + 2..coff + 4].try_into().unwrap());
        assert_eq!(n_sections, 4);
    }

    #[test]
    fn rsrc_over_budget_is_rejected() {
        let mut input = PeInput::default();
        input.version_info.file_description = "x".repeat(8000);
        let err = write_pe(&input).unwrap_err();
        assert!(matches!(err, PeError::ResourceBudgetExceeded { .. }));
    }

    #[test]
    fn dos_header_page_fields_match_the_actual_stub_size() {
        let mut w = ByteWriter::new();
        let stub = dos_stub();
        write_dos_header(&mut w, &stub, align_up((DOS_HEADER_SIZE + stub.len()) as u32, 8));
        let image = w.into_vec();
        let e_cblp = u16::from_le_bytes(image[2..4].try_into().unwrap());
        let e_cp = u16::from_le_bytes(image[4..6].try_into().unwrap());
        let total = (DOS_HEADER_SIZE + stub.len()) as u32;
        assert_eq!(e_cp, 1);
        assert_eq!(e_cblp as u32, total % 512);
    }

    #[test]
    fn coff_characteristics_include_relocs_stripped() {
        let image = write_pe(&PeInput::default()).expect("default input lays out cleanly");
        let e_lfanew = u32::from_le_bytes(image[0x3C..0x40].try_into().unwrap()) as usize;
        let coff = e_lfanew + 4;
        let characteristics = u16::from_le_bytes(image[coff + 18..coff + 20].try_into().unwrap());
        assert_eq!(characteristics, 0x0103);
    }

    #[test]
    fn optional_header_reports_os_and_subsystem_version_3_10() {
        let image = write_pe(&PeInput::default()).expect("default input lays out cleanly");
        let e_lfanew = u32::from_le_bytes(image[0x3C..0x40].try_into().unwrap()) as usize;
        let opt = e_lfanew + 4 + COFF_HEADER_SIZE;
        // MajorOSVersion/MinorOSVersion sit 40 bytes into the optional header
        // (magic, linker version, 5 size/address u32 fields, 3 more u32s).
        let major_os = u16::from_le_bytes(image[opt + 40..opt + 42].try_into().unwrap());
        let minor_os = u16::from_le_bytes(image[opt + 42..opt + 44].try_into().unwrap());
        let major_subsystem = u16::from_le_bytes(image[opt + 48..opt + 50].try_into().unwrap());
        let minor_subsystem = u16::from_le_bytes(image[opt + 50..opt + 52].try_into().unwrap());
        assert_eq!((major_os, minor_os), (3, 10));
        assert_eq!((major_subsystem, minor_subsystem), (3, 10));
    }
}
