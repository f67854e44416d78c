use rafs::{
    BatteryLevel, ChargerEvent, Config, FormatKind, IoArg, IoReply, IocType, MinimumBattery,
    OpenMode, Partition, Rafs, RafsError, RamPartition, RamPartitionManager,
};

const PARTITION: &str = "/VMdl";
const BLOCK: usize = 4096;

fn mounted(blocks: u32) -> (Rafs<RamPartitionManager>, RamPartition) {
    let part = RamPartition::new(BLOCK as u32, blocks);
    let mut manager = RamPartitionManager::new();
    manager.insert("VMdl", part.clone());

    let mut fs = Rafs::init(manager, Config::default());
    fs.format(PARTITION, FormatKind::Normal).unwrap();
    fs.mount(None, PARTITION).unwrap();
    fs.run_until_idle();
    (fs, part)
}

fn path(name: &str) -> String {
    format!("{}/{}", PARTITION, name)
}

fn create(fs: &mut Rafs<RamPartitionManager>, name: &str, data: &[u8]) {
    let file = fs.open(None, &path(name), OpenMode::Write).unwrap();
    assert_eq!(fs.write(file, data), Ok(data.len()));
    fs.close(file).unwrap();
}

fn read_all(fs: &mut Rafs<RamPartitionManager>, name: &str) -> Vec<u8> {
    let file = fs.open(None, &path(name), OpenMode::Read).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 1000];
    loop {
        match fs.read(file, &mut buf) {
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(RafsError::NoMoreData) => break,
            Err(e) => panic!("read failed: {}", e),
        }
    }
    fs.close(file).unwrap();
    out
}

fn remove(fs: &mut Rafs<RamPartitionManager>, name: &str) {
    fs.remove(None, &path(name)).unwrap();
    fs.run_until_idle();
}

#[test]
fn test_basic_lifecycle() {
    let (mut fs, _) = mounted(16);
    let payload: Vec<u8> = (0..100u8).collect();

    let file = fs.open(None, &path("A"), OpenMode::Write).unwrap();
    assert_eq!(fs.write(file, &payload), Ok(100));
    fs.close(file).unwrap();

    let file = fs.open(None, &path("A"), OpenMode::Read).unwrap();
    let mut buf = [0u8; 100];
    assert_eq!(fs.read(file, &mut buf), Ok(100));
    assert_eq!(&buf[..], &payload[..]);
    assert_eq!(fs.read(file, &mut buf), Err(RafsError::NoMoreData));
    fs.close(file).unwrap();

    fs.unmount(PARTITION).unwrap();
    assert!(fs.shutdown().is_ok());
}

#[test]
fn test_contents_survive_remount() {
    let (mut fs, _) = mounted(16);
    let big: Vec<u8> = (0..3 * BLOCK + 17).map(|i| (i % 251) as u8).collect();
    create(&mut fs, "big.bin", &big);
    create(&mut fs, "small", b"hello");
    fs.unmount(PARTITION).unwrap();

    fs.mount(None, PARTITION).unwrap();
    fs.run_until_idle();
    assert_eq!(read_all(&mut fs, "big.bin"), big);
    assert_eq!(read_all(&mut fs, "small"), b"hello");
}

#[test]
fn test_delete_and_reclaim() {
    let (mut fs, _) = mounted(16);
    let whole = vec![0xA5u8; 14 * BLOCK];

    create(&mut fs, "A", &whole);
    assert_eq!(fs.statfs(PARTITION).unwrap().free_space, 0);
    assert_eq!(
        fs.open(None, &path("B"), OpenMode::Write),
        Err(RafsError::FileSystemFull)
    );

    remove(&mut fs, "A");
    assert_eq!(fs.statfs(PARTITION).unwrap().free_space, (14 * BLOCK) as u32);
    create(&mut fs, "B", &whole);
    assert_eq!(read_all(&mut fs, "B"), whole);
    assert_eq!(
        fs.open(None, &path("A"), OpenMode::Read),
        Err(RafsError::FileNotFound)
    );
}

#[test]
fn test_directory_full() {
    let (mut fs, _) = mounted(16);
    for i in 0..112 {
        create(&mut fs, &format!("F{}", i), b"");
    }
    assert_eq!(
        fs.open(None, &path("one_more"), OpenMode::Write),
        Err(RafsError::FileSystemFull)
    );
    assert_eq!(fs.statfs(PARTITION).unwrap().num_dir_entries, 112);
}

#[test]
fn test_file_full_after_three_extents() {
    let (mut fs, _) = mounted(16);
    let block = vec![0x11u8; BLOCK];
    for i in 0..14 {
        create(&mut fs, &format!("F{}", i), &block);
    }
    // Punch single-block holes at blocks 2, 4, 6 and 8.
    for i in [0, 2, 4, 6] {
        remove(&mut fs, &format!("F{}", i));
    }

    let file = fs.open(None, &path("frag"), OpenMode::Write).unwrap();
    assert_eq!(fs.write(file, &vec![0x22u8; 5 * BLOCK]), Err(RafsError::FileFull));
    fs.close(file).unwrap();

    assert_eq!(read_all(&mut fs, "frag"), vec![0x22u8; 3 * BLOCK]);
    assert_eq!(fs.statfs(PARTITION).unwrap().free_space, BLOCK as u32);
}

#[test]
fn test_max_files_opened() {
    let (mut fs, _) = mounted(16);
    create(&mut fs, "A", b"abc");

    let writer = fs.open(None, &path("B"), OpenMode::Write).unwrap();
    assert_eq!(
        fs.open(None, &path("C"), OpenMode::Write),
        Err(RafsError::MaxFilesOpened)
    );
    assert_eq!(
        fs.open(None, &path("A"), OpenMode::Write),
        Err(RafsError::FileExists)
    );

    let readers: Vec<_> = (0..3)
        .map(|_| fs.open(None, &path("A"), OpenMode::Read).unwrap())
        .collect();
    assert_eq!(
        fs.open(None, &path("A"), OpenMode::Read),
        Err(RafsError::MaxFilesOpened)
    );
    assert_eq!(fs.unmount(PARTITION), Err(RafsError::FileStillOpen));

    for reader in readers {
        fs.close(reader).unwrap();
    }
    fs.close(writer).unwrap();
    assert_eq!(fs.close(writer), Err(RafsError::BadId));
}

#[test]
fn test_read_handles_reject_writes_and_seek() {
    let (mut fs, _) = mounted(16);
    let data: Vec<u8> = (0..2 * BLOCK).map(|i| (i / 7) as u8).collect();
    create(&mut fs, "A", &data);

    let file = fs.open(None, &path("A"), OpenMode::Read).unwrap();
    assert_eq!(fs.write(file, b"x"), Err(RafsError::BadId));
    fs.set_position(file, 5000).unwrap();
    let mut buf = [0u8; 10];
    assert_eq!(fs.read(file, &mut buf), Ok(10));
    assert_eq!(&buf[..], &data[5000..5010]);
    assert_eq!(fs.position(file), Ok(5010));
    assert_eq!(fs.set_position(file, data.len() as u32), Err(RafsError::InvalidSeek));
    fs.close(file).unwrap();

    let writer = fs.open(None, &path("B"), OpenMode::Write).unwrap();
    assert_eq!(fs.set_position(writer, 0), Err(RafsError::NotSeekable));
    fs.close(writer).unwrap();
}

#[test]
fn test_access_counts_reads() {
    let (mut fs, _) = mounted(16);
    create(&mut fs, "A", b"abc");
    for _ in 0..3 {
        read_all(&mut fs, "A");
    }

    let (dir, count) = fs.open_directory(&path("")).unwrap();
    assert_eq!(count, 1);
    let stat = fs.read_directory(dir).unwrap();
    assert_eq!(stat.filename, "A");
    assert_eq!(stat.file_size, 3);
    assert_eq!(stat.sequence_count, 1);
    assert_eq!(stat.access_count, 0b111);
    assert_eq!(fs.read_directory(dir), Err(RafsError::NoMoreFiles));

    assert_eq!(fs.open_directory(&path("")), Err(RafsError::DirectoryOpen));
    assert_eq!(fs.unmount(PARTITION), Err(RafsError::DirectoryOpen));
    fs.close_directory(dir).unwrap();
    assert_eq!(fs.read_directory(dir), Err(RafsError::BadId));
}

#[test]
fn test_state_errors() {
    let part = RamPartition::new(BLOCK as u32, 16);
    let mut manager = RamPartitionManager::new();
    manager.insert("VMdl", part);
    let mut fs = Rafs::init(manager, Config::default());

    assert_eq!(fs.mount(None, PARTITION), Err(RafsError::InvalidFat));
    assert_eq!(fs.mount(None, "/other"), Err(RafsError::NoPartition));
    assert_eq!(fs.statfs(PARTITION), Err(RafsError::NotMounted));

    fs.format(PARTITION, FormatKind::Normal).unwrap();
    fs.mount(None, PARTITION).unwrap();
    assert_eq!(fs.mount_status(PARTITION), Err(RafsError::Busy));
    assert_eq!(fs.open(None, &path("A"), OpenMode::Write), Err(RafsError::Busy));
    fs.run_until_idle();
    fs.mount_status(PARTITION).unwrap();

    assert_eq!(fs.mount(None, PARTITION), Err(RafsError::AlreadyMounted));
    assert_eq!(fs.format(PARTITION, FormatKind::Normal), Err(RafsError::StillMounted));
    assert_eq!(fs.open(None, &path("bad-name"), OpenMode::Write), Err(RafsError::InvalidCharacter));
    assert_eq!(fs.remove(None, &path("missing")), Err(RafsError::FileNotFound));

    let fs = match fs.shutdown() {
        Err((fs, RafsError::StillMounted)) => fs,
        other => panic!("unexpected shutdown result: {:?}", other.map(|_| ())),
    };
    let mut fs = fs;
    fs.unmount(PARTITION).unwrap();
    assert_eq!(fs.unmount(PARTITION), Err(RafsError::NotMounted));
    assert!(fs.shutdown().is_ok());
}

#[test]
fn test_forced_format_unmounts() {
    let (mut fs, part) = mounted(16);
    create(&mut fs, "A", b"abc");

    fs.format(PARTITION, FormatKind::Forced).unwrap();
    assert_eq!(fs.mounted_partition(), None);

    fs.mount(None, PARTITION).unwrap();
    fs.run_until_idle();
    assert_eq!(fs.statfs(PARTITION).unwrap().num_dir_entries, 0);
    assert!(part.snapshot()[36..72].iter().all(|b| *b == 0xFF));
}

#[test]
fn test_power_gate_vetoes_writes() {
    let (fs, _) = mounted(16);
    let mut fs = fs.with_power_policy(Box::new(MinimumBattery {
        floor: BatteryLevel::Low,
    }));
    create(&mut fs, "A", b"abc");

    fs.notify_battery(BatteryLevel::Critical);
    assert_eq!(fs.open(None, &path("B"), OpenMode::Write), Err(RafsError::LowPower));
    assert_eq!(fs.remove(None, &path("A")), Err(RafsError::LowPower));
    assert_eq!(read_all(&mut fs, "A"), b"abc");

    fs.notify_charger(ChargerEvent::Attached);
    create(&mut fs, "B", b"def");
    fs.notify_charger(ChargerEvent::Detached);
    assert_eq!(fs.open(None, &path("C"), OpenMode::Write), Err(RafsError::LowPower));

    fs.notify_battery(BatteryLevel::Ok);
    create(&mut fs, "C", b"ghi");
}

#[test]
fn test_io_controls() {
    let (mut fs, _) = mounted(16);
    create(&mut fs, "first", &vec![1u8; BLOCK + 1]);
    create(&mut fs, "second", b"x");

    assert_eq!(IocType::try_from(1), Ok(IocType::GetFileOffset));
    assert_eq!(fs.file_offset(&path("first")), Ok(2 * BLOCK as u32));
    assert_eq!(fs.file_offset(&path("second")), Ok(4 * BLOCK as u32));
    assert_eq!(fs.file_offset(&path("third")), Err(RafsError::FileNotFound));

    let info = fs.partition_handle(PARTITION).unwrap().info();
    assert_eq!(info.block_size, BLOCK as u32);
    assert_eq!(fs.partition_handle("/other").err(), Some(RafsError::NotMounted));

    match fs.io_control(1, IoArg::Path(&path("second"))) {
        Ok(IoReply::FileOffset(offset)) => assert_eq!(offset, 4 * BLOCK as u32),
        other => panic!("unexpected reply {:?}", other.map(|_| ())),
    }
    match fs.io_control(0, IoArg::Path(PARTITION)) {
        Ok(IoReply::Partition(part)) => assert_eq!(part.info().block_size, BLOCK as u32),
        other => panic!("unexpected reply {:?}", other.map(|_| ())),
    }
    assert_eq!(
        fs.io_control(3, IoArg::Path(PARTITION)).err(),
        Some(RafsError::UnsupportedIoControl(3))
    );
}
