mod common;

use std::sync::Arc;

use common::FakeTarget;
use joydb::interfaces::PatchFileError;
use joydb::patches::PatchStore;

fn patches_for(target: &Arc<FakeTarget>) -> PatchStore {
    PatchStore::new(target.clone(), target.clone())
}

fn target_with_module() -> Arc<FakeTarget> {
    let target = FakeTarget::new();
    target.add_module("test.exe", 0x400000, 0x10000, "test.exe");
    target
}

#[test]
fn set_records_and_get_returns_patch() {
    let target = target_with_module();
    let patches = patches_for(&target);

    assert!(patches.set(0x401000, 0x74, 0xEB));
    let patch = patches.get(0x401000).expect("patch should exist");
    assert_eq!(patch.module, "test.exe");
    assert_eq!(patch.rva, 0x1000);
    assert_eq!(patch.old_byte, 0x74);
    assert_eq!(patch.new_byte, 0xEB);
}

#[test]
fn degenerate_patch_is_a_successful_noop() {
    let target = target_with_module();
    let patches = patches_for(&target);

    assert!(patches.set(0x401000, 0x90, 0x90));
    assert!(patches.get(0x401000).is_none());
}

#[test]
fn set_rejects_unreadable_addresses() {
    let target = target_with_module();
    let patches = patches_for(&target);
    assert!(!patches.set(0xdead0000, 0x74, 0xEB));
}

#[test]
fn repeated_edits_merge_onto_first_original() {
    // Set(addr, o, n1) then Set(addr, n1, n2) must leave exactly one patch
    // {old: o, new: n2}.
    let target = target_with_module();
    let patches = patches_for(&target);

    assert!(patches.set(0x401000, 0x74, 0xEB));
    assert!(patches.set(0x401000, 0xEB, 0x90));

    assert_eq!(patches.len(), 1);
    let patch = patches.get(0x401000).unwrap();
    assert_eq!(patch.old_byte, 0x74);
    assert_eq!(patch.new_byte, 0x90);
}

#[test]
fn editing_back_to_original_removes_the_patch() {
    let target = target_with_module();
    let patches = patches_for(&target);

    assert!(patches.set(0x401000, 0x74, 0xEB));
    assert!(patches.set(0x401000, 0xEB, 0x74));
    assert!(patches.get(0x401000).is_none());
    assert!(patches.is_empty());
}

#[test]
fn delete_with_restore_writes_original_back() {
    let target = target_with_module();
    let patches = patches_for(&target);

    assert!(patches.set(0x401000, 0x74, 0xEB));
    assert!(patches.delete(0x401000, true));
    assert_eq!(target.written_byte(0x401000), Some(0x74));
    assert!(patches.get(0x401000).is_none());

    // Absent key: silent false.
    assert!(!patches.delete(0x401000, true));
}

#[test]
fn delete_without_restore_leaves_memory_alone() {
    let target = target_with_module();
    let patches = patches_for(&target);

    assert!(patches.set(0x401000, 0x74, 0xEB));
    assert!(patches.delete(0x401000, false));
    assert_eq!(target.written_byte(0x401000), None);
}

#[test]
fn delete_range_restores_per_entry() {
    let target = target_with_module();
    let patches = patches_for(&target);

    assert!(patches.set(0x401000, 0x11, 0xAA));
    assert!(patches.set(0x401001, 0x22, 0xBB));
    assert!(patches.set(0x402000, 0x33, 0xCC));

    patches.delete_range(0x401000, 0x401002, true);
    assert_eq!(target.written_byte(0x401000), Some(0x11));
    assert_eq!(target.written_byte(0x401001), Some(0x22));
    assert_eq!(target.written_byte(0x402000), None);
    assert_eq!(patches.len(), 1);
}

#[test]
fn delete_range_wildcard_clears_without_restoring() {
    let target = target_with_module();
    let patches = patches_for(&target);

    assert!(patches.set(0x401000, 0x11, 0xAA));
    assert!(patches.set(0x402000, 0x22, 0xBB));

    patches.delete_range(0, u64::MAX, true);
    assert!(patches.is_empty());
    assert_eq!(target.written_byte(0x401000), None);
}

#[test]
fn rebasing_applies_to_patches_too() {
    let target = target_with_module();
    let patches = patches_for(&target);

    assert!(patches.set(0x401000, 0x74, 0xEB));
    target.move_module("test.exe", 0x500000);
    let patch = patches.get(0x501000).expect("patch must rebase");
    assert_eq!(patches.va_of(&patch), 0x501000);
}

#[test]
fn clear_module_only_touches_that_module() {
    let target = target_with_module();
    target.add_module("other.dll", 0x700000, 0x10000, "other.dll");
    let patches = patches_for(&target);

    assert!(patches.set(0x401000, 0x11, 0xAA));
    assert!(patches.set(0x700100, 0x22, 0xBB));

    patches.clear_module("TEST.EXE");
    assert!(patches.get(0x401000).is_none());
    assert!(patches.get(0x700100).is_some());
}

#[test]
fn export_1337_uses_module_headers_and_uppercase_hex() {
    let target = target_with_module();
    let patches = patches_for(&target);

    assert!(patches.set(0x401000, 0x74, 0xEB));
    assert!(patches.set(0x40100A, 0x0F, 0x90));

    let mut entries = patches.list();
    entries.sort_by_key(|entry| entry.rva);
    let text = patches.export_1337(&entries);
    assert_eq!(
        text,
        ">test.exe\n0000000000001000:74->EB\n000000000000100A:0F->90"
    );
}

#[test]
fn export_c_requires_a_parseable_image() {
    let dir = tempfile::tempdir().expect("tempdir");
    let module_path = dir.path().join("test.exe");
    std::fs::write(&module_path, b"not a pe image").unwrap();

    let target = FakeTarget::new();
    target.add_module("test.exe", 0x400000, 0x10000, &module_path);
    let patches = patches_for(&target);
    assert!(patches.set(0x401000, 0x74, 0xEB));

    // Not a valid image: offset resolution must fail as a whole.
    let err = patches.export_c(&patches.list()).unwrap_err();
    assert!(matches!(err, PatchFileError::InvalidImage));
}

#[test]
fn patch_file_error_taxonomy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let module_path = dir.path().join("test.exe");
    std::fs::write(&module_path, b"not a pe image").unwrap();
    let out_path = dir.path().join("patched.exe");

    let target = FakeTarget::new();
    target.add_module("test.exe", 0x400000, 0x10000, &module_path);
    target.add_module("other.dll", 0x700000, 0x10000, dir.path().join("other.dll"));
    let patches = patches_for(&target);

    // Empty batch.
    assert!(matches!(
        patches.patch_file(&[], &out_path),
        Err(PatchFileError::NoPatches)
    ));

    // Mixed modules.
    assert!(patches.set(0x401000, 0x74, 0xEB));
    assert!(patches.set(0x700100, 0x22, 0xBB));
    let mut entries = patches.list();
    entries.sort_by_key(|entry| entry.module.clone());
    assert!(matches!(
        patches.patch_file(&entries, &out_path),
        Err(PatchFileError::MixedModules(_))
    ));

    // The copy is made but the image does not parse.
    let own: Vec<_> = entries
        .into_iter()
        .filter(|entry| entry.module == "test.exe")
        .collect();
    assert!(matches!(
        patches.patch_file(&own, &out_path),
        Err(PatchFileError::InvalidImage)
    ));
    assert!(out_path.exists(), "copy happens before mapping");

    // Module file missing entirely: the copy fails, nothing is written.
    std::fs::remove_file(&module_path).unwrap();
    let out2 = dir.path().join("patched2.exe");
    assert!(matches!(
        patches.patch_file(&own, &out2),
        Err(PatchFileError::CopyFailed(_))
    ));
    assert!(!out2.exists());
}
