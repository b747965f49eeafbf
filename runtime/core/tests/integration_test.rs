//! End-to-end tests: core brought up on the mock kernel, sessions
//! obtained through the router, operations driven through the RPC stubs.

use std::sync::Arc;

use lattice_base::{Affinity, AffinityLocation, Args, CapQuota, Capability, RamQuota};
use lattice_core::elf::{ElfBinary, ElfClass, SegmentFlags};
use lattice_core::region_map::{Perms, RegionMapClient};
use lattice_core::services::cpu::{CpuSessionClient, THREAD_PAUSED, THREAD_RUNNING};
use lattice_core::services::io_port::IoPortSessionClient;
use lattice_core::services::irq::IrqSessionClient;
use lattice_core::services::log::LogSessionClient;
use lattice_core::services::pd::PdSessionClient;
use lattice_core::services::rom::RomSessionClient;
use lattice_core::services::trace::TraceSessionClient;
use lattice_core::{BootInfo, BootModule, Core, IrqRange, PhysRegion, PortRegion};
use lattice_kernel::MockKernel;
use lattice_session::{Child, SessionError, SessionOutcome};

fn boot_info() -> BootInfo {
    BootInfo {
        ram: vec![PhysRegion {
            base: 0x10_0000,
            size: 0x800_0000,
        }],
        mmio: vec![PhysRegion {
            base: 0xfebc_0000,
            size: 0x2_0000,
        }],
        io_ports: vec![PortRegion {
            base: 0x3f8,
            count: 8,
        }],
        irqs: vec![IrqRange { base: 0, count: 16 }],
        modules: vec![BootModule {
            name: "config".into(),
            base: 0x20_0000,
            size: 9,
            cmdline: "/image/config".into(),
            content: b"<config/>".to_vec(),
        }],
        affinity: lattice_base::AffinitySpace::new(2, 1),
    }
}

struct Harness {
    kernel: Arc<MockKernel>,
    core: Arc<Core>,
    child: Arc<Child>,
}

fn harness() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let kernel = Arc::new(MockKernel::new());
    let core = Core::new(kernel.clone(), &boot_info());
    let child = core
        .create_child("init", RamQuota { value: 8 << 20 }, CapQuota { value: 256 })
        .unwrap();
    Harness { kernel, core, child }
}

fn open_session(h: &Harness, service: &str, args: &str) -> Capability {
    let (_, outcome) = h
        .core
        .router()
        .session(&h.child, service, &Args::new(args), &Affinity::default())
        .unwrap();
    match outcome {
        SessionOutcome::Ready(cap) => cap,
        SessionOutcome::Pending => panic!("core services answer synchronously"),
    }
}

fn pd_client(h: &Harness, args: &str) -> (lattice_base::Id, PdSessionClient) {
    let (id, outcome) = h
        .core
        .router()
        .session(&h.child, "PD", &Args::new(args), &Affinity::default())
        .unwrap();
    let SessionOutcome::Ready(cap) = outcome else {
        panic!("PD sessions are synchronous");
    };
    (id, PdSessionClient::new(h.core.client(cap)))
}

#[test]
fn test_unknown_service_is_denied() {
    let h = harness();
    let refusal = h
        .core
        .router()
        .session(
            &h.child,
            "Nitpicker",
            &Args::new("ram_quota=4K"),
            &Affinity::default(),
        )
        .unwrap_err();
    assert_eq!(refusal, SessionError::Denied);
}

#[test]
fn test_pd_session_dataspace_roundtrip() {
    let h = harness();
    let child_ram = h.child.ram_account().limit().value;
    let (id, pd) = pd_client(&h, "ram_quota=1M, cap_quota=32, label=\"app\"");

    // the donation left the child
    assert_eq!(
        h.child.ram_account().limit().value,
        child_ram - (1 << 20)
    );

    let ds = pd.alloc(0x3000, lattice_core::CacheAttribute::Cached).unwrap();
    assert_eq!(pd.dataspace_size(ds).unwrap(), 0x3000);
    assert_eq!(pd.used_ram().unwrap().value, 0x3000);
    assert_eq!(pd.used_caps().unwrap().value, 1);

    // content is observable through the pool and zero-filled
    let dataspace = h.core.dataspace_pool().lookup(ds.selector()).unwrap();
    assert!(dataspace.read().iter().all(|b| *b == 0));

    pd.free(ds).unwrap();
    assert_eq!(pd.used_ram().unwrap().value, 0);

    // closing refunds the donation
    h.core.router().close(&h.child, id).unwrap();
    assert_eq!(h.child.ram_account().limit().value, child_ram);
    assert!(h.core.pd_registry().is_empty());
}

#[test]
fn test_pd_session_with_thin_donation_is_refused() {
    let h = harness();
    let refusal = h
        .core
        .router()
        .session(
            &h.child,
            "PD",
            &Args::new("ram_quota=4K, cap_quota=16"),
            &Affinity::default(),
        )
        .unwrap_err();
    assert_eq!(refusal, SessionError::InsufficientRamQuota);

    let refusal = h
        .core
        .router()
        .session(
            &h.child,
            "PD",
            &Args::new("ram_quota=64K, cap_quota=1"),
            &Affinity::default(),
        )
        .unwrap_err();
    assert_eq!(refusal, SessionError::InsufficientCapQuota);
}

#[test]
fn test_region_map_attach_through_stubs() {
    let h = harness();
    let (_, pd) = pd_client(&h, "ram_quota=1M, cap_quota=32, label=\"app\"");

    let ds = pd.alloc(0x2000, lattice_core::CacheAttribute::Cached).unwrap();
    let rm_cap = pd.address_space().unwrap();
    let rm = RegionMapClient::new(h.core.client(rm_cap));

    assert!(rm.size().unwrap() > 1 << 40);
    let vaddr = rm
        .attach(ds, 0, 0, None, Perms::READ | Perms::WRITE)
        .unwrap();
    assert_eq!(vaddr % 0x1000, 0);

    // the same range cannot be attached twice
    assert!(rm.attach(ds, 0, 0, Some(vaddr), Perms::READ).is_err());
    rm.detach(vaddr).unwrap();
    rm.attach(ds, 0, 0, Some(vaddr), Perms::READ).unwrap();

    // stack and linker area are separate maps
    let stack_cap = pd.stack_area().unwrap();
    let stack = RegionMapClient::new(h.core.client(stack_cap));
    stack.attach(ds, 0, 0, Some(vaddr), Perms::READ | Perms::WRITE).unwrap();
}

#[test]
fn test_quota_transfer_between_pd_sessions() {
    let h = harness();
    let (_, donor) = pd_client(&h, "ram_quota=2M, cap_quota=32, label=\"donor\"");
    let (_, rcpt) = pd_client(&h, "ram_quota=64K, cap_quota=16, label=\"rcpt\"");

    rcpt.ref_account(donor.cap()).unwrap();

    let donor_before = donor.ram_quota().unwrap().value;
    let rcpt_before = rcpt.ram_quota().unwrap().value;

    donor
        .transfer_ram(rcpt.cap(), RamQuota { value: 1 << 20 })
        .unwrap();
    assert_eq!(donor.ram_quota().unwrap().value, donor_before - (1 << 20));
    assert_eq!(rcpt.ram_quota().unwrap().value, rcpt_before + (1 << 20));

    // an over-transfer fails without effect
    assert!(rcpt
        .transfer_ram(donor.cap(), RamQuota { value: 1 << 30 })
        .is_err());
    assert_eq!(rcpt.ram_quota().unwrap().value, rcpt_before + (1 << 20));
}

#[test]
fn test_rom_session_serves_boot_module() {
    let h = harness();
    let cap = open_session(&h, "ROM", "ram_quota=8K, label=\"config\"");
    let rom = RomSessionClient::new(h.core.client(cap));

    let ds = rom.dataspace().unwrap();
    let dataspace = h.core.dataspace_pool().lookup(ds.selector()).unwrap();
    assert_eq!(dataspace.read(), b"<config/>");
    assert!(!dataspace.writable());
}

#[test]
fn test_rom_unknown_module_is_denied() {
    let h = harness();
    let refusal = h
        .core
        .router()
        .session(
            &h.child,
            "ROM",
            &Args::new("ram_quota=8K, label=\"does_not_exist\""),
            &Affinity::default(),
        )
        .unwrap_err();
    assert_eq!(refusal, SessionError::Denied);
}

#[test]
fn test_dynamic_rom_signals_watcher() {
    let h = harness();
    h.core.rom_registry().insert("status", b"v1".to_vec());

    let (_, pd) = pd_client(&h, "ram_quota=1M, cap_quota=32, label=\"watcher\"");
    let source_cap = pd.alloc_signal_source().unwrap();
    let context_cap = pd.alloc_context(source_cap, 0x57a7).unwrap();

    let rom_cap = open_session(&h, "ROM", "ram_quota=8K, label=\"status\"");
    let rom = RomSessionClient::new(h.core.client(rom_cap));
    let ds = rom.dataspace().unwrap();
    assert!(rom.sigh(context_cap));

    assert!(h.core.rom_registry().publish("status", b"v2".to_vec()));

    let source = h.core.signal_broker().source(source_cap).unwrap();
    let signal = source.wait().unwrap();
    assert_eq!(signal.imprint, 0x57a7);
    assert_eq!(signal.num, 1);

    // same size, refresh in place
    assert!(rom.update());
    let dataspace = h.core.dataspace_pool().lookup(ds.selector()).unwrap();
    assert_eq!(dataspace.read(), b"v2");
}

#[test]
fn test_io_mem_window_and_conflict() {
    let h = harness();
    let cap = open_session(
        &h,
        "IO_MEM",
        "ram_quota=8K, base=0xfebc0000, size=0x10000, wc=yes, label=\"nic\"",
    );
    let io_mem = lattice_core::services::io_mem::IoMemSessionClient::new(h.core.client(cap));
    let ds = io_mem.dataspace().unwrap();
    let dataspace = h.core.dataspace_pool().lookup(ds.selector()).unwrap();
    assert_eq!(dataspace.phys_base(), Some(0xfebc_0000));
    assert_eq!(dataspace.size(), 0x1_0000);

    // overlapping request from another client is denied
    let refusal = h
        .core
        .router()
        .session(
            &h.child,
            "IO_MEM",
            &Args::new("ram_quota=8K, base=0xfebc8000, size=0x1000, label=\"late\""),
            &Affinity::default(),
        )
        .unwrap_err();
    assert_eq!(refusal, SessionError::Denied);

    // outside the platform windows
    let refusal = h
        .core
        .router()
        .session(
            &h.child,
            "IO_MEM",
            &Args::new("ram_quota=8K, base=0x10000000, size=0x1000, label=\"bogus\""),
            &Affinity::default(),
        )
        .unwrap_err();
    assert_eq!(refusal, SessionError::Denied);
}

#[test]
fn test_io_port_session_accessors() {
    let h = harness();
    let cap = open_session(
        &h,
        "IO_PORT",
        "ram_quota=8K, io_port_base=0x3f8, io_port_size=8, label=\"uart\"",
    );
    let ports = IoPortSessionClient::new(h.core.client(cap));

    ports.outb(0x3f8, 0x42).unwrap();
    assert_eq!(ports.inb(0x3f8).unwrap(), 0x42);
    ports.outw(0x3fa, 0xbeef).unwrap();
    assert_eq!(ports.inw(0x3fa).unwrap(), 0xbeef);
    assert!(ports.inl(0x3f6).is_err());

    // the range is claimed
    let refusal = h
        .core
        .router()
        .session(
            &h.child,
            "IO_PORT",
            &Args::new("ram_quota=8K, io_port_base=0x3f8, io_port_size=1"),
            &Affinity::default(),
        )
        .unwrap_err();
    assert_eq!(refusal, SessionError::Denied);
}

#[test]
fn test_irq_session_delivers_gated_signals() {
    let h = harness();
    let (_, pd) = pd_client(&h, "ram_quota=1M, cap_quota=32, label=\"driver\"");
    let source_cap = pd.alloc_signal_source().unwrap();
    let context_cap = pd.alloc_context(source_cap, 4).unwrap();

    let irq_cap = open_session(
        &h,
        "IRQ",
        "ram_quota=8K, irq_number=4, irq_trigger=edge, irq_polarity=high, label=\"uart\"",
    );
    let irq = IrqSessionClient::new(h.core.client(irq_cap));
    irq.sigh(context_cap).unwrap();

    let handle = h.core.irq_service().irq_handle(irq_cap).unwrap();
    let source = h.core.signal_broker().source(source_cap).unwrap();

    h.kernel.raise_irq(handle).unwrap();
    assert_eq!(source.wait().unwrap().num, 1);

    // a second interrupt latches until the acknowledge
    h.kernel.raise_irq(handle).unwrap();
    assert!(source.try_wait().is_none());
    irq.ack_irq().unwrap();
    assert_eq!(source.wait().unwrap().num, 1);

    // the line is exclusive
    let refusal = h
        .core
        .router()
        .session(
            &h.child,
            "IRQ",
            &Args::new("ram_quota=8K, irq_number=4"),
            &Affinity::default(),
        )
        .unwrap_err();
    assert_eq!(refusal, SessionError::Denied);
}

#[test]
fn test_cpu_threads_and_trace_subjects() {
    let h = harness();
    let (_, pd) = pd_client(&h, "ram_quota=1M, cap_quota=32, label=\"app\"");

    let cpu_cap = open_session(&h, "CPU", "ram_quota=32K, cap_quota=8, label=\"app\"");
    let cpu = CpuSessionClient::new(h.core.client(cpu_cap));

    let thread = cpu
        .create_thread(pd.cap(), "worker", AffinityLocation::single(1, 0), 20, 0)
        .unwrap();
    cpu.start(thread, 0x40_1000, 0x7fff_0000).unwrap();

    let state = cpu.state(thread).unwrap();
    assert_eq!(state.status, THREAD_RUNNING);
    assert_eq!(state.ip, 0x40_1000);
    assert_eq!(state.cpu, 1);

    cpu.pause(thread).unwrap();
    assert_eq!(cpu.state(thread).unwrap().status, THREAD_PAUSED);
    cpu.resume(thread).unwrap();
    cpu.single_step(thread, true).unwrap();
    assert!(cpu.state(thread).unwrap().single_step);

    // the thread is a trace subject
    let trace_cap = open_session(&h, "TRACE", "ram_quota=64K, label=\"monitor\"");
    let trace = TraceSessionClient::new(h.core.client(trace_cap));
    let subjects = trace.subjects().unwrap();
    assert_eq!(subjects.len(), 1);
    assert_eq!(subjects[0].name, "worker");

    let buffer = trace.alloc_buffer(subjects[0].id, 0x4000).unwrap();
    cpu.trace_control(thread, true).unwrap();
    assert!(trace.subjects().unwrap()[0].enabled);
    assert!(trace.subjects().unwrap()[0].has_buffer);

    // killing the thread closes the trace buffer
    cpu.kill_thread(thread).unwrap();
    assert!(h.core.dataspace_pool().lookup(buffer.selector()).is_none());
    assert!(trace.subjects().unwrap().is_empty());
    assert!(cpu.state(thread).is_err());
}

#[test]
fn test_log_session_collects_lines() {
    let h = harness();
    let cap = open_session(&h, "LOG", "ram_quota=4K, label=\"app\"");
    let log = LogSessionClient::new(h.core.client(cap));

    assert_eq!(log.write("hello core\n"), 11);
    log.write("two ");
    log.write("parts\n");

    let component = h.core.log_service().session_component(cap).unwrap();
    assert_eq!(
        component.lines(),
        vec!["hello core".to_string(), "two parts".to_string()]
    );
}

#[test]
fn test_elf_module_loads_into_region_map() {
    let h = harness();
    let (_, pd) = pd_client(&h, "ram_quota=2M, cap_quota=32, label=\"loader\"");

    let image = build_elf64(
        62,
        0x40_0000,
        &[
            (0x40_0000, b"text-bytes".as_slice(), 0x1000, 0x1 | 0x4),
            (0x60_0000, b"data".as_slice(), 0x2000, 0x2 | 0x4),
        ],
    );
    let binary = ElfBinary::parse(&image).unwrap();
    binary.check_target(ElfClass::Elf64, 62).unwrap();
    assert_eq!(binary.entry, 0x40_0000);

    let rm_cap = pd.address_space().unwrap();
    let rm = RegionMapClient::new(h.core.client(rm_cap));

    for segment in &binary.segments {
        let ds = pd
            .alloc(segment.mem_size, lattice_core::CacheAttribute::Cached)
            .unwrap();
        let dataspace = h.core.dataspace_pool().lookup(ds.selector()).unwrap();
        let start = segment.file_offset as usize;
        let end = start + segment.file_size as usize;
        dataspace.write_at(0, &image[start..end]);

        let mut perms = Perms::empty();
        if segment.flags.contains(SegmentFlags::READ) {
            perms |= Perms::READ;
        }
        if segment.flags.contains(SegmentFlags::WRITE) {
            perms |= Perms::WRITE;
        }
        if segment.flags.contains(SegmentFlags::EXEC) {
            perms |= Perms::EXEC;
        }
        let vaddr = rm
            .attach(ds, 0, segment.mem_size, Some(segment.vaddr), perms)
            .unwrap();
        assert_eq!(vaddr, segment.vaddr);
    }

    // the text segment content landed at its virtual address
    let pd_component = {
        let registry = h.core.pd_registry();
        registry.get(pd.cap().selector()).unwrap()
    };
    let (base, attachment) = pd_component.address_space().at(0x40_0004).unwrap();
    assert_eq!(base, 0x40_0000);
    let mut buf = [0u8; 10];
    attachment.dataspace.read_at(0, &mut buf);
    assert_eq!(&buf, b"text-bytes");
}

#[test]
fn test_pd_destruction_returns_everything() {
    let h = harness();
    let baseline_objects = h.kernel.object_count();
    let child_ram = h.child.ram_account().limit().value;
    let child_caps = h.child.cap_account().limit().value;

    let (id, pd) = pd_client(&h, "ram_quota=1M, cap_quota=32, label=\"doomed\"");
    pd.alloc(0x4000, lattice_core::CacheAttribute::Cached).unwrap();
    pd.alloc_signal_source().unwrap();
    let ep_cap = Capability::new(1, lattice_base::IfaceId(1));
    pd.alloc_rpc_cap(ep_cap).unwrap();
    assert!(h.kernel.object_count() > baseline_objects);

    let avail_before_close = h.core.platform().ram_avail();
    h.core.router().close(&h.child, id).unwrap();

    // quota refunded, kernel objects gone, physical pages back
    assert_eq!(h.child.ram_account().limit().value, child_ram);
    assert_eq!(h.child.cap_account().limit().value, child_caps);
    assert_eq!(h.kernel.object_count(), baseline_objects);
    assert!(h.core.platform().ram_avail() >= avail_before_close);
    assert!(h.core.pd_registry().is_empty());
    assert_eq!(h.core.router().live_sessions(), 0);
}

/// Minimal ELF64 builder for the loader test
fn build_elf64(machine: u16, entry: u64, segments: &[(u64, &[u8], u64, u32)]) -> Vec<u8> {
    let phoff = 0x40usize;
    let phentsize = 0x38usize;
    let data_start = phoff + segments.len() * phentsize;

    let mut image = vec![0u8; data_start];
    image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    image[4] = 2;
    image[5] = 1;
    image[6] = 1;
    image[0x12..0x14].copy_from_slice(&machine.to_le_bytes());
    image[0x14..0x18].copy_from_slice(&1u32.to_le_bytes());
    image[0x18..0x20].copy_from_slice(&entry.to_le_bytes());
    image[0x20..0x28].copy_from_slice(&(phoff as u64).to_le_bytes());
    image[0x36..0x38].copy_from_slice(&(phentsize as u16).to_le_bytes());
    image[0x38..0x3a].copy_from_slice(&(segments.len() as u16).to_le_bytes());

    let mut file_offset = data_start as u64;
    for (index, (vaddr, bytes, mem_size, flags)) in segments.iter().enumerate() {
        let at = phoff + index * phentsize;
        image[at..at + 4].copy_from_slice(&1u32.to_le_bytes());
        image[at + 4..at + 8].copy_from_slice(&flags.to_le_bytes());
        image[at + 8..at + 16].copy_from_slice(&file_offset.to_le_bytes());
        image[at + 16..at + 24].copy_from_slice(&vaddr.to_le_bytes());
        image[at + 32..at + 40].copy_from_slice(&(bytes.len() as u64).to_le_bytes());
        image[at + 40..at + 48].copy_from_slice(&mem_size.to_le_bytes());
        file_offset += bytes.len() as u64;
    }
    for (_, bytes, _, _) in segments {
        image.extend_from_slice(bytes);
    }
    image
}
