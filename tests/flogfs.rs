//! End-to-end scenarios against the RAM-backed NAND array.

use flogfs::{Flogfs, FsError, Geometry, MemNand};

/// 512 B sectors, 4 per page, 2 pages per block: one block stores
/// 504 + 5 * 512 + 500 = 3564 payload bytes.
const BLOCK_PAYLOAD: usize = 3564;

fn geo(blocks: u16) -> Geometry {
    Geometry {
        sector_size: 512,
        sectors_per_page: 4,
        pages_per_block: 2,
        blocks,
    }
}

fn fresh_fs(blocks: u16) -> Flogfs<MemNand> {
    let fs = Flogfs::new(MemNand::new(geo(blocks))).unwrap();
    fs.format().unwrap();
    fs.mount().unwrap();
    fs
}

/// Simulates a power cycle: drops all RAM state, keeps the media.
fn power_cycle(fs: Flogfs<MemNand>) -> Flogfs<MemNand> {
    let mut dev = fs.into_device();
    dev.clear_operation_budget();
    let fs = Flogfs::new(dev).unwrap();
    fs.mount().unwrap();
    fs
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

fn put(fs: &Flogfs<MemNand>, name: &str, data: &[u8]) {
    let mut wf = fs.open_write(name).unwrap();
    assert_eq!(fs.write(&mut wf, data).unwrap(), data.len());
    fs.close_write(wf).unwrap();
}

fn slurp(fs: &Flogfs<MemNand>, name: &str) -> Vec<u8> {
    let mut rf = fs.open_read(name).unwrap();
    let mut out = Vec::new();
    let mut chunk = [0u8; 300];
    loop {
        let n = fs.read(&mut rf, &mut chunk).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }
    // A read at EOF keeps returning 0.
    assert_eq!(fs.read(&mut rf, &mut chunk).unwrap(), 0);
    fs.close_read(rf).unwrap();
    out
}

fn ls(fs: &Flogfs<MemNand>) -> Vec<String> {
    let mut lister = fs.ls_start().unwrap();
    let mut names = Vec::new();
    while let Some(name) = fs.ls_next(&mut lister).unwrap() {
        names.push(name.as_str().to_string());
    }
    fs.ls_stop(lister);
    names
}

#[test]
fn fresh_format_lists_nothing() {
    let fs = fresh_fs(16);
    assert!(ls(&fs).is_empty());
}

#[test]
fn hello_roundtrip() {
    let fs = fresh_fs(16);
    put(&fs, "a", b"hello");

    let mut rf = fs.open_read("a").unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(fs.read(&mut rf, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(fs.read(&mut rf, &mut buf).unwrap(), 0);
    fs.close_read(rf).unwrap();
}

#[test]
fn open_read_missing_file_fails() {
    let fs = fresh_fs(16);
    assert_eq!(fs.open_read("nope").err(), Some(FsError::NotFound));
    assert!(!fs.exists("nope").unwrap());
}

#[test]
fn empty_file_roundtrip() {
    let fs = fresh_fs(16);
    let wf = fs.open_write("empty").unwrap();
    fs.close_write(wf).unwrap();

    assert!(fs.exists("empty").unwrap());
    assert_eq!(slurp(&fs, "empty"), Vec::<u8>::new());

    // And it stays an empty live file across a remount.
    let fs = power_cycle(fs);
    assert!(fs.exists("empty").unwrap());
    assert_eq!(slurp(&fs, "empty"), Vec::<u8>::new());
}

#[test]
fn single_block_spans() {
    let fs = fresh_fs(16);
    // One full init sector, exactly one block, one byte over.
    for (name, len) in [("s0", 504), ("s1", 504 + 512), ("b0", BLOCK_PAYLOAD), ("b1", BLOCK_PAYLOAD + 1)] {
        let data = pattern(len);
        put(&fs, name, &data);
        assert_eq!(slurp(&fs, name), data, "length {len}");
    }
}

#[test]
fn cross_block_roundtrip() {
    let fs = fresh_fs(16);
    let data = vec![0x5A; 2000];
    put(&fs, "log", &data);
    assert_eq!(slurp(&fs, "log"), data);

    let long = pattern(5000);
    put(&fs, "long", &long);
    assert_eq!(slurp(&fs, "long"), long);

    // Both survive a remount.
    let fs = power_cycle(fs);
    assert_eq!(slurp(&fs, "log"), data);
    assert_eq!(slurp(&fs, "long"), long);
}

#[test]
fn append_across_close() {
    let fs = fresh_fs(16);
    put(&fs, "a", b"abc");
    put(&fs, "a", b"def");
    assert_eq!(slurp(&fs, "a"), b"abcdef");

    // Append again after a remount, across the flushed-sector boundary.
    let fs = power_cycle(fs);
    put(&fs, "a", b"ghi");
    assert_eq!(slurp(&fs, "a"), b"abcdefghi");
}

#[test]
fn append_across_block_boundary() {
    let fs = fresh_fs(16);
    let first = pattern(BLOCK_PAYLOAD);
    put(&fs, "a", &first);
    put(&fs, "a", b"tail");

    let mut expect = first;
    expect.extend_from_slice(b"tail");
    assert_eq!(slurp(&fs, "a"), expect);
}

#[test]
fn filename_length_limits() {
    let fs = fresh_fs(16);

    let ok = "n".repeat(31);
    put(&fs, &ok, b"x");
    assert!(fs.exists(&ok).unwrap());

    let too_long = "n".repeat(32);
    assert_eq!(fs.open_write(&too_long).err(), Some(FsError::NameTooLong));
    assert_eq!(fs.exists(&too_long).err(), Some(FsError::NameTooLong));
}

#[test]
fn write_handles_are_exclusive() {
    let fs = fresh_fs(16);
    let wf = fs.open_write("a").unwrap();
    assert_eq!(fs.open_write("a").err(), Some(FsError::Busy));
    fs.close_write(wf).unwrap();

    // Closing releases the claim.
    let wf = fs.open_write("a").unwrap();
    fs.close_write(wf).unwrap();
}

#[test]
fn remove_refuses_open_files() {
    let fs = fresh_fs(16);
    put(&fs, "a", b"data");

    let rf = fs.open_read("a").unwrap();
    assert_eq!(fs.remove("a").err(), Some(FsError::Busy));
    fs.close_read(rf).unwrap();
    fs.remove("a").unwrap();
}

#[test]
fn remove_is_not_found_twice() {
    let fs = fresh_fs(16);
    put(&fs, "a", b"data");

    fs.remove("a").unwrap();
    assert_eq!(fs.remove("a").err(), Some(FsError::NotFound));
    assert_eq!(fs.remove("a").err(), Some(FsError::NotFound));
    assert!(!fs.exists("a").unwrap());
    assert!(ls(&fs).is_empty());
}

#[test]
fn delete_reclaims_blocks() {
    let fs = fresh_fs(16);
    let baseline = fs.available_blocks().unwrap();

    let data = pattern(3 * BLOCK_PAYLOAD);
    put(&fs, "t", &data);
    assert_eq!(fs.available_blocks().unwrap(), baseline - 4);
    fs.remove("t").unwrap();
    assert_eq!(fs.available_blocks().unwrap(), baseline);

    // Cold remount agrees, and the reclaimed blocks carry the
    // unallocated tag again.
    let fs = power_cycle(fs);
    assert_eq!(fs.available_blocks().unwrap(), baseline);
    assert!(!fs.exists("t").unwrap());

    let dev = fs.into_device();
    let mut unallocated = 0;
    for block in 0..16 {
        if dev.spare_bytes(block, 0)[0] == 0xFF {
            unallocated += 1;
        }
    }
    // Everything except inode0 reads free.
    assert_eq!(unallocated, 15);
}

#[test]
fn ls_enumerates_live_files_in_creation_order() {
    let fs = fresh_fs(24);
    for name in ["one", "two", "three", "four"] {
        put(&fs, name, name.as_bytes());
    }
    assert_eq!(ls(&fs), ["one", "two", "three", "four"]);

    fs.remove("two").unwrap();
    assert_eq!(ls(&fs), ["one", "three", "four"]);

    // A recreated file re-enters at the end of the table.
    put(&fs, "two", b"again");
    assert_eq!(ls(&fs), ["one", "three", "four", "two"]);

    let fs = power_cycle(fs);
    assert_eq!(ls(&fs), ["one", "three", "four", "two"]);
    assert_eq!(slurp(&fs, "two"), b"again");
}

#[test]
fn double_mount_is_a_noop() {
    let fs = fresh_fs(16);
    put(&fs, "a", b"data");
    fs.mount().unwrap();
    assert_eq!(slurp(&fs, "a"), b"data");
}

#[test]
fn operations_require_mount() {
    let fs = Flogfs::new(MemNand::new(geo(16))).unwrap();
    fs.format().unwrap();
    assert_eq!(fs.open_read("a").err(), Some(FsError::NotMounted));
    assert_eq!(fs.exists("a").err(), Some(FsError::NotMounted));
    assert_eq!(fs.available_blocks().err(), Some(FsError::NotMounted));
}

#[test]
fn format_refused_while_mounted() {
    let fs = fresh_fs(16);
    assert_eq!(fs.format().err(), Some(FsError::AlreadyMounted));
}

#[test]
fn media_full_write_goes_short_then_recovers() {
    let fs = fresh_fs(8);
    put(&fs, "keep", b"spare me");

    let mut wf = fs.open_write("big").unwrap();
    let chunk = pattern(512);
    let mut accepted = 0usize;
    loop {
        let n = fs.write(&mut wf, &chunk).unwrap();
        accepted += n;
        if n < chunk.len() {
            break;
        }
        assert!(accepted < 64 * 1024, "media never filled");
    }

    // Out of space: nothing more is accepted.
    assert_eq!(fs.write(&mut wf, &chunk).unwrap(), 0);
    assert_eq!(fs.available_blocks().unwrap(), 0);

    // Committed data is readable while the writer is still open.
    let committed = slurp(&fs, "big");
    assert!(committed.len() <= accepted);
    assert!(accepted - committed.len() < 512);

    // Freeing a block lets the stalled writer make progress again.
    fs.remove("keep").unwrap();
    let n = fs.write(&mut wf, &chunk).unwrap();
    assert!(n > 0);
    fs.close_write(wf).unwrap();
}

#[test]
fn unmount_flushes_open_writers() {
    let fs = fresh_fs(16);
    let mut wf = fs.open_write("a").unwrap();
    fs.write(&mut wf, b"buffered").unwrap();
    fs.unmount().unwrap();

    fs.mount().unwrap();
    assert_eq!(slurp(&fs, "a"), b"buffered");
}

#[test]
fn bad_blocks_are_never_used() {
    let mut dev = MemNand::new(geo(16));
    dev.mark_bad(2);
    dev.mark_bad(5);
    let fs = Flogfs::new(dev).unwrap();
    fs.format().unwrap();
    fs.mount().unwrap();

    // inode0 and the two bad blocks are out of the pool.
    assert_eq!(fs.available_blocks().unwrap(), 13);

    let data = pattern(4 * BLOCK_PAYLOAD);
    put(&fs, "big", &data);
    assert_eq!(slurp(&fs, "big"), data);

    let fs = power_cycle(fs);
    assert_eq!(slurp(&fs, "big"), data);

    let dev = fs.into_device();
    assert_eq!(dev.erase_count(2), 0);
    assert_eq!(dev.erase_count(5), 0);
}

#[test]
fn crash_between_link_commit_and_successor_init() {
    let fs = fresh_fs(16);
    let baseline = fs.available_blocks().unwrap();

    // Exactly one block of payload: the tail sector commits and the
    // successor block is claimed, but its init sector is still pending
    // when the power goes.
    let data = pattern(BLOCK_PAYLOAD);
    let mut wf = fs.open_write("log").unwrap();
    assert_eq!(fs.write(&mut wf, &data).unwrap(), data.len());
    core::mem::forget(wf);

    let fs = power_cycle(fs);
    // Every committed byte is back, nothing more.
    assert_eq!(slurp(&fs, "log"), data);
    // The half-done allocation was completed, not rolled back.
    assert_eq!(fs.available_blocks().unwrap(), baseline - 2);

    // The recovered chain keeps growing normally.
    put(&fs, "log", b"more");
    let mut expect = data;
    expect.extend_from_slice(b"more");
    assert_eq!(slurp(&fs, "log"), expect);
}

#[test]
fn crash_midway_through_a_large_write() {
    let fs = fresh_fs(16);
    let data = pattern(2 * BLOCK_PAYLOAD + 300);

    let mut wf = fs.open_write("log").unwrap();
    assert_eq!(fs.write(&mut wf, &data).unwrap(), data.len());
    // Cut power before the close flushes the buffered partial sector.
    core::mem::forget(wf);

    let fs = power_cycle(fs);
    let recovered = slurp(&fs, "log");
    // Whole committed sectors survive; the buffered remainder is lost.
    assert!(recovered.len() <= data.len());
    assert!(data.len() - recovered.len() < 512);
    assert_eq!(recovered, data[..recovered.len()]);
}
