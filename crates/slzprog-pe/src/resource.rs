//! `.rsrc` hierarchical resource directory: version info, string tables,
//! the icon-like raw-data blob, and the application manifest.
//!
//! A [`ResourceNode`] tree is built with the four standard top-level type
//! groups, then flattened into a breadth-first arena so every directory's
//! child offsets are resolvable in a single forward pass: each node is
//! assigned an offset equal to the running size of every node enqueued
//! ahead of it, which is exactly the order the arena is serialised in.

use std::collections::VecDeque;

use crate::bytes::{align_up, ByteWriter};

pub const RT_STRING: u32 = 6;
pub const RT_RCDATA: u32 = 10;
pub const RT_VERSION: u32 = 16;
pub const RT_MANIFEST: u32 = 24;

const DIR_ENTRY_SIZE: u32 = 8;
const DIR_HEADER_SIZE: u32 = 16;
const LEAF_HEADER_SIZE: u32 = 16;
const HIGH_BIT: u32 = 0x8000_0000;

/// A node in the resource directory tree: either a sub-directory keyed by
/// integer id, or a leaf carrying raw data and a code page.
#[derive(Debug, Clone)]
pub enum ResourceNode {
    Directory(Vec<(u32, ResourceNode)>),
    Leaf { data: Vec<u8>, code_page: u32 },
}

impl ResourceNode {
    pub fn leaf(data: Vec<u8>) -> ResourceNode {
        ResourceNode::Leaf { data, code_page: 0 }
    }
}

/// Builds the standard four-type-group resource tree: RT_VERSION,
/// RT_STRING, RT_RCDATA, RT_MANIFEST, each under a language sub-directory.
pub fn default_resource_tree(version: &VersionInfo) -> ResourceNode {
    let lang_neutral = |leaf: ResourceNode| ResourceNode::Directory(vec![(0, leaf)]);
    ResourceNode::Directory(vec![
        (
            RT_VERSION,
            ResourceNode::Directory(vec![(1, lang_neutral(ResourceNode::leaf(build_version_info(version))))]),
        ),
        (RT_STRING, build_string_table_group()),
        (
            RT_RCDATA,
            ResourceNode::Directory(vec![(1, lang_neutral(ResourceNode::leaf(build_rcdata_blob())))]),
        ),
        (
            RT_MANIFEST,
            ResourceNode::Directory(vec![(1, lang_neutral(ResourceNode::leaf(MANIFEST_XML.as_bytes().to_vec())))]),
        ),
    ])
}

enum FlatKind {
    Directory { entries: Vec<(u32, usize)> },
    Leaf { data: Vec<u8>, code_page: u32 },
}

/// Flattens `root` into breadth-first arena order: node `0` is the root,
/// and every node's children were enqueued (and so occupy later arena
/// slots) before that node is dequeued for serialisation.
fn flatten_bfs(root: ResourceNode) -> Vec<FlatKind> {
    let mut arena: Vec<FlatKind> = vec![FlatKind::Leaf { data: Vec::new(), code_page: 0 }];
    let mut queue: VecDeque<(usize, ResourceNode)> = VecDeque::new();
    queue.push_back((0, root));

    while let Some((idx, node)) = queue.pop_front() {
        match node {
            ResourceNode::Leaf { data, code_page } => {
                arena[idx] = FlatKind::Leaf { data, code_page };
            }
            ResourceNode::Directory(children) => {
                let mut entries = Vec::with_capacity(children.len());
                for (id, child) in children {
                    let child_idx = arena.len();
                    arena.push(FlatKind::Leaf { data: Vec::new(), code_page: 0 });
                    entries.push((id, child_idx));
                    queue.push_back((child_idx, child));
                }
                arena[idx] = FlatKind::Directory { entries };
            }
        }
    }
    arena
}

fn node_size(node: &FlatKind) -> u32 {
    match node {
        FlatKind::Directory { entries } => DIR_HEADER_SIZE + DIR_ENTRY_SIZE * entries.len() as u32,
        FlatKind::Leaf { data, .. } => LEAF_HEADER_SIZE + align_up(data.len() as u32, 4),
    }
}

/// Serialises `root` into a complete `.rsrc` section body. `rsrc_rva` is
/// the section's own RVA, needed to turn each leaf's local offset into the
/// absolute `DataRVA` a `IMAGE_RESOURCE_DATA_ENTRY` carries.
pub fn build_rsrc(root: ResourceNode, rsrc_rva: u32) -> Vec<u8> {
    let arena = flatten_bfs(root);
    let mut offsets = vec![0u32; arena.len()];
    let mut cursor = 0u32;
    for (i, node) in arena.iter().enumerate() {
        offsets[i] = cursor;
        cursor += node_size(node);
    }

    let mut w = ByteWriter::new();
    for node in &arena {
        match node {
            FlatKind::Directory { entries } => {
                let mut sorted = entries.clone();
                sorted.sort_by_key(|(id, _)| *id);
                w.u32(0); // Characteristics
                w.u32(0); // TimeDateStamp
                w.u16(0); // MajorVersion
                w.u16(0); // MinorVersion
                w.u16(0); // NumberOfNamedEntries (id-only tree)
                w.u16(sorted.len() as u16); // NumberOfIdEntries
                for (id, child_idx) in &sorted {
                    w.u32(*id);
                    let is_dir = matches!(arena[*child_idx], FlatKind::Directory { .. });
                    let offset = offsets[*child_idx];
                    w.u32(if is_dir { offset | HIGH_BIT } else { offset });
                }
            }
            FlatKind::Leaf { data, code_page } => {
                let data_rva = rsrc_rva + w.position() as u32 + LEAF_HEADER_SIZE;
                w.u32(data_rva);
                w.u32(data.len() as u32);
                w.u32(*code_page);
                w.u32(0); // Reserved
                w.bytes(data);
                w.align_to(4);
            }
        }
    }
    w.into_vec()
}

/// Static fields a `VS_FIXEDFILEINFO` + `StringFileInfo` block carries.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub file_version: (u16, u16, u16, u16),
    pub product_version: (u16, u16, u16, u16),
    pub company_name: String,
    pub file_description: String,
    pub internal_name: String,
    pub legal_copyright: String,
    pub original_filename: String,
    pub product_name: String,
}

impl Default for VersionInfo {
    fn default() -> VersionInfo {
        VersionInfo {
            file_version: (1, 0, 0, 0),
            product_version: (1, 0, 0, 0),
            company_name: String::new(),
            file_description: "slzprog-compiled executable".to_string(),
            internal_name: "slzprog-output".to_string(),
            legal_copyright: String::new(),
            original_filename: "slzprog-output.exe".to_string(),
            product_name: "slzprog-output".to_string(),
        }
    }
}

fn align4(w: &mut ByteWriter) {
    w.align_to(4);
}

/// Opens a `VS_VERSIONINFO`-family block: reserves `wLength`, writes
/// `wValueLength`/`wType`, the null-terminated UTF-16LE key, and pads to a
/// 4-byte boundary. Returns the position `finish_block` must back-patch.
fn open_block(w: &mut ByteWriter, key: &str, value_len: u16, w_type: u16) -> usize {
    let len_pos = w.position();
    w.u16(0); // wLength placeholder
    w.u16(value_len);
    w.u16(w_type);
    w.utf16le_cstr(key);
    align4(w);
    len_pos
}

fn close_block(w: &mut ByteWriter, len_pos: usize) {
    align4(w);
    let total = (w.position() - len_pos) as u16;
    w.set_u16_at(len_pos, total);
}

/// Writes one `String` entry (`wType = 1`, text): `wValueLength` counts
/// UTF-16 code units, not bytes.
fn write_string_entry(w: &mut ByteWriter, key: &str, value: &str) {
    let code_units = value.encode_utf16().count() as u16 + 1; // + null terminator
    let start = open_block(w, key, code_units, 1);
    w.utf16le_cstr(value);
    close_block(w, start);
}

/// Builds the full RT_VERSION leaf: `VS_VERSIONINFO` wrapping a binary
/// `VS_FIXEDFILEINFO`, a `StringFileInfo`/`StringTable` (langID 0x0409,
/// codepage 0x04B0), and a `VarFileInfo`/`Translation` pair (both
/// VS_VERSIONINFO encoding).
pub fn build_version_info(info: &VersionInfo) -> Vec<u8> {
    let mut w = ByteWriter::new();
    let root = open_block(&mut w, "VS_VERSION_INFO", 52, 0);

    // VS_FIXEDFILEINFO -- fixed 52-byte binary structure.
    w.u32(0xFEEF_04BD); // dwSignature
    w.u32(0x0001_0000); // dwStrucVersion
    let (fv_ms_hi, fv_ms_lo, fv_ls_hi, fv_ls_lo) = info.file_version;
    w.u16(fv_ms_lo);
    w.u16(fv_ms_hi); // dwFileVersionMS (hi.lo packed as lo16,hi16 little endian word order)
    w.u16(fv_ls_lo);
    w.u16(fv_ls_hi); // dwFileVersionLS
    let (pv_ms_hi, pv_ms_lo, pv_ls_hi, pv_ls_lo) = info.product_version;
    w.u16(pv_ms_lo);
    w.u16(pv_ms_hi); // dwProductVersionMS
    w.u16(pv_ls_lo);
    w.u16(pv_ls_hi); // dwProductVersionLS
    w.u32(0x3F); // dwFileFlagsMask
    w.u32(0); // dwFileFlags
    w.u32(0x0004_0004); // dwFileOS = VOS_NT_WINDOWS32
    w.u32(0x1); // dwFileType = VFT_APP
    w.u32(0); // dwFileSubtype
    w.u32(0); // dwFileDateMS
    w.u32(0); // dwFileDateLS
    align4(&mut w);

    // StringFileInfo
    let sfi = open_block(&mut w, "StringFileInfo", 0, 1);
    let st = open_block(&mut w, "040904B0", 0, 1);
    write_string_entry(&mut w, "CompanyName", &info.company_name);
    write_string_entry(&mut w, "FileDescription", &info.file_description);
    write_string_entry(
        &mut w,
        "FileVersion",
        &format!(
            "{}.{}.{}.{}",
            info.file_version.0, info.file_version.1, info.file_version.2, info.file_version.3
        ),
    );
    write_string_entry(&mut w, "InternalName", &info.internal_name);
    write_string_entry(&mut w, "LegalCopyright", &info.legal_copyright);
    write_string_entry(&mut w, "OriginalFilename", &info.original_filename);
    write_string_entry(&mut w, "ProductName", &info.product_name);
    write_string_entry(
        &mut w,
        "ProductVersion",
        &format!(
            "{}.{}.{}.{}",
            info.product_version.0, info.product_version.1, info.product_version.2, info.product_version.3
        ),
    );
    close_block(&mut w, st);
    close_block(&mut w, sfi);

    // VarFileInfo / Translation
    let vfi = open_block(&mut w, "VarFileInfo", 0, 1);
    let var = open_block(&mut w, "Translation", 4, 0);
    w.u16(0x0409);
    w.u16(0x04B0);
    close_block(&mut w, var);
    close_block(&mut w, vfi);

    close_block(&mut w, root);
    w.into_vec()
}

/// Builds the three locale string-table bundles (en-US 1033, ja-JP 1041,
/// zh-CN 2052), each with 16 length-prefixed UTF-16LE slots, empty slots
/// acting as separators.
fn build_string_table_group() -> ResourceNode {
    const LOCALES: [u32; 3] = [1033, 1041, 2052];
    let mut table_entries = Vec::new();
    for id in 1..=16u32 {
        let mut w = ByteWriter::new();
        // This build ships no localized UI strings; every slot is an
        // explicit empty separator, matching the fixed 16-slot bundle shape.
        for _ in 0..16 {
            w.u16(0);
        }
        let leaf = ResourceNode::leaf(w.into_vec());
        table_entries.push((
            id,
            ResourceNode::Directory(LOCALES.iter().map(|&l| (l, leaf.clone())).collect()),
        ));
    }
    ResourceNode::Directory(table_entries)
}

/// A 256-byte blob containing `0x00..=0xFF` in order.
fn build_rcdata_blob() -> Vec<u8> {
    (0u16..=255).map(|b| b as u8).collect()
}

/// The application manifest: Windows Vista-10 `supportedOS`, Common
/// Controls v6, DPI awareness `PerMonitorV2`, `asInvoker` execution level.
pub const MANIFEST_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<assembly xmlns="urn:schemas-microsoft-com:asm.v1" manifestVersion="1.0">
  <trustInfo xmlns="urn:schemas-microsoft-com:asm.v3">
    <security>
      <requestedPrivileges>
        <requestedExecutionLevel level="asInvoker" uiAccess="false"/>
      </requestedPrivileges>
    </security>
  </trustInfo>
  <compatibility xmlns="urn:schemas-microsoft-com:compatibility.v1">
    <application>
      <supportedOS Id="{e2011457-1546-43c5-a5fe-008deee3d3f0}"/>
      <supportedOS Id="{35138b9a-5d96-4fbd-8e2d-a2440225f93a}"/>
      <supportedOS Id="{4a2f28e3-53b9-4441-ba9c-d69d4a4a6e38}"/>
      <supportedOS Id="{1f676c76-80e1-4239-95bb-83d0f6d0da78}"/>
      <supportedOS Id="{8e0f7a12-bfb3-4fe8-b9a5-48fd50a15a9a}"/>
    </application>
  </compatibility>
  <application xmlns="urn:schemas-microsoft-com:asm.v3">
    <windowsSettings>
      <dpiAwareness xmlns="http://schemas.microsoft.com/SMI/2016/WindowsSettings">PerMonitorV2</dpiAwareness>
    </windowsSettings>
  </application>
  <dependency>
    <dependentAssembly>
      <assemblyIdentity type="win32" name="Microsoft.Windows.Common-Controls" version="6.0.0.0" processorArchitecture="*" publicKeyToken="6595b64144ccf1df" language="*"/>
    </dependentAssembly>
  </dependency>
</assembly>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rcdata_blob_is_256_bytes_in_order() {
        let blob = build_rcdata_blob();
        assert_eq!(blob.len(), 256);
        assert_eq!(blob[0], 0);
        assert_eq!(blob[255], 0xFF);
    }

    #[test]
    fn flatten_bfs_assigns_root_to_index_zero() {
        let tree = ResourceNode::Directory(vec![(1, ResourceNode::leaf(vec![1, 2, 3]))]);
        let arena = flatten_bfs(tree);
        assert!(matches!(arena[0], FlatKind::Directory { .. }));
        assert!(matches!(arena[1], FlatKind::Leaf { .. }));
    }

    #[test]
    fn build_rsrc_places_root_directory_at_offset_zero_with_rva_inside_section() {
        let tree = default_resource_tree(&VersionInfo::default());
        let bytes = build_rsrc(tree, 0x5000);
        assert!(!bytes.is_empty());
        // root's NumberOfIdEntries (offset 14) matches the four top-level groups.
        let n = u16::from_le_bytes([bytes[14], bytes[15]]);
        assert_eq!(n, 4);
    }

    #[test]
    fn version_info_length_is_back_patched_and_nonzero() {
        let bytes = build_version_info(&VersionInfo::default());
        let w_len = u16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(w_len as usize, bytes.len());
    }

    #[test]
    fn manifest_declares_asinvoker_and_common_controls() {
        assert!(MANIFEST_XML.contains("asInvoker"));
        assert!(MANIFEST_XML.contains("Common-Controls"));
        assert!(MANIFEST_XML.contains("PerMonitorV2"));
    }
}
