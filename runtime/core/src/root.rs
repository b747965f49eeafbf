//! Core bring-up: one entrypoint, eight services, one router
//!
//! Builds the platform from the boot hand-over, registers every boot
//! module with the ROM registry, synthesizes the `platform_info` ROM,
//! publishes the per-resource services, and wires the session router
//! whose accounts every transfer path terminates at. Core has no parent;
//! a request that resolves to nothing is denied.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use lattice_base::rpc::{Entrypoint, RpcClient};
use lattice_base::{Account, CapQuota, Capability, Label, RamQuota, SessionKind};
use lattice_kernel::KernelInterface;
use lattice_session::{
    Child, LocalService, RoutePolicy, RouteTarget, SessionError, SessionRouter,
};

use crate::bootinfo::BootInfo;
use crate::dataspace::DataspacePool;
use crate::platform::Platform;
use crate::services::cpu::CpuService;
use crate::services::io_mem::IoMemService;
use crate::services::io_port::IoPortService;
use crate::services::irq::IrqService;
use crate::services::log::LogService;
use crate::services::pd::{PdRegistry, PdService};
use crate::services::rom::{RomRegistry, RomService};
use crate::services::signal::SignalBroker;
use crate::services::trace::{TraceRegistry, TraceService};

/// Capability budget of core's own root account
const CORE_CAP_QUOTA: u64 = 0x10000;

/// Core's routing: local services only, everything else denied
struct CorePolicy {
    services: HashMap<SessionKind, Arc<dyn LocalService>>,
}

impl RoutePolicy for CorePolicy {
    fn resolve(&self, _child: &str, service: &str, _label: &Label) -> RouteTarget {
        match self.services.get(&SessionKind::from_service_name(service)) {
            Some(service) => RouteTarget::Local(service.clone()),
            None => RouteTarget::Deny,
        }
    }
}

pub struct Core {
    kernel: Arc<dyn KernelInterface>,
    platform: Arc<Platform>,
    pool: Arc<DataspacePool>,
    hub: Arc<SignalBroker>,
    rom: Arc<RomRegistry>,
    ep: Arc<Entrypoint>,
    pd_registry: Arc<PdRegistry>,
    trace_registry: Arc<TraceRegistry>,
    irq_service: Arc<IrqService>,
    log_service: Arc<LogService>,
    router: Arc<SessionRouter>,
}

impl Core {
    pub fn new(kernel: Arc<dyn KernelInterface>, info: &BootInfo) -> Arc<Self> {
        let platform = Arc::new(Platform::new(info));
        let pool = DataspacePool::new();
        let hub = SignalBroker::new();

        let rom = RomRegistry::new(hub.clone());
        rom.register_boot_modules(&info.modules);
        rom.insert("platform_info", platform_info(&platform));

        let ep = Arc::new(Entrypoint::new("core"));
        let pd_registry = PdRegistry::new();
        let trace_registry = TraceRegistry::new(pool.clone());

        let pd_service = PdService::new(
            kernel.clone(),
            platform.clone(),
            pool.clone(),
            hub.clone(),
            ep.clone(),
            pd_registry.clone(),
        );
        let cpu_service = CpuService::new(
            kernel.clone(),
            platform.affinity_space(),
            pd_registry.clone(),
            trace_registry.clone(),
            ep.clone(),
        );
        let rom_service = RomService::new(rom.clone(), pool.clone(), ep.clone());
        let io_mem_service =
            IoMemService::new(kernel.clone(), platform.clone(), pool.clone(), ep.clone());
        let io_port_service = IoPortService::new(kernel.clone(), platform.clone(), ep.clone());
        let irq_service =
            IrqService::new(kernel.clone(), platform.clone(), hub.clone(), ep.clone());
        let trace_service = TraceService::new(
            trace_registry.clone(),
            platform.clone(),
            pool.clone(),
            ep.clone(),
        );
        let log_service = LogService::new(ep.clone());

        let mut services: HashMap<SessionKind, Arc<dyn LocalService>> = HashMap::new();
        for service in [
            pd_service.clone() as Arc<dyn LocalService>,
            cpu_service as Arc<dyn LocalService>,
            rom_service as Arc<dyn LocalService>,
            io_mem_service as Arc<dyn LocalService>,
            io_port_service as Arc<dyn LocalService>,
            irq_service.clone() as Arc<dyn LocalService>,
            trace_service as Arc<dyn LocalService>,
            log_service.clone() as Arc<dyn LocalService>,
        ] {
            services.insert(SessionKind::from_service_name(service.name()), service);
        }

        let router = Arc::new(SessionRouter::new(
            Box::new(CorePolicy { services }),
            Account::new(
                "core",
                RamQuota {
                    value: platform.ram_total(),
                },
            ),
            Account::new(
                "core",
                CapQuota {
                    value: CORE_CAP_QUOTA,
                },
            ),
        ));

        log::info!(
            "core is up: {} MiB RAM, {} CPUs, {} boot modules",
            platform.ram_total() >> 20,
            platform.affinity_space().total(),
            info.modules.len()
        );

        Arc::new(Self {
            kernel,
            platform,
            pool,
            hub,
            rom,
            ep,
            pd_registry,
            trace_registry,
            irq_service,
            log_service,
            router,
        })
    }

    /// Register a child and seed it with quota from core's root account
    pub fn create_child(
        &self,
        name: &str,
        ram: RamQuota,
        caps: CapQuota,
    ) -> Result<Arc<Child>, SessionError> {
        let child = Child::new(
            name,
            Account::new(name, RamQuota { value: 0 }),
            Account::new(name, CapQuota { value: 0 }),
        );
        child.ram_account().ref_account(self.router.ram_account());
        child.cap_account().ref_account(self.router.cap_account());
        self.router
            .ram_account()
            .transfer_to(child.ram_account(), ram)
            .map_err(|_| SessionError::OutOfRam)?;
        if self
            .router
            .cap_account()
            .transfer_to(child.cap_account(), caps)
            .is_err()
        {
            let _ = child
                .ram_account()
                .transfer_to(self.router.ram_account(), ram);
            return Err(SessionError::OutOfCaps);
        }
        self.router.add_child(child.clone());
        Ok(child)
    }

    /// Client stub plumbing for a capability served by core's entrypoint
    pub fn client(&self, cap: Capability) -> RpcClient {
        self.ep.client(cap)
    }

    pub fn router(&self) -> &Arc<SessionRouter> {
        &self.router
    }

    pub fn kernel(&self) -> &Arc<dyn KernelInterface> {
        &self.kernel
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn dataspace_pool(&self) -> &Arc<DataspacePool> {
        &self.pool
    }

    pub fn signal_broker(&self) -> &Arc<SignalBroker> {
        &self.hub
    }

    pub fn rom_registry(&self) -> &Arc<RomRegistry> {
        &self.rom
    }

    pub fn pd_registry(&self) -> &Arc<PdRegistry> {
        &self.pd_registry
    }

    pub fn trace_registry(&self) -> &Arc<TraceRegistry> {
        &self.trace_registry
    }

    pub fn irq_service(&self) -> &Arc<IrqService> {
        &self.irq_service
    }

    pub fn log_service(&self) -> &Arc<LogService> {
        &self.log_service
    }
}

/// Content of the generated `platform_info` ROM
fn platform_info(platform: &Platform) -> Vec<u8> {
    let space = platform.affinity_space();
    let mut out = String::new();
    let _ = writeln!(out, "<platform_info>");
    let _ = writeln!(
        out,
        "\t<affinity-space width=\"{}\" height=\"{}\"/>",
        space.width, space.height
    );
    let _ = writeln!(out, "\t<ram total=\"{:#x}\"/>", platform.ram_total());
    let _ = writeln!(out, "</platform_info>");
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootinfo::PhysRegion;
    use lattice_base::AffinitySpace;
    use lattice_kernel::MockKernel;

    fn boot_info() -> BootInfo {
        BootInfo {
            ram: vec![PhysRegion {
                base: 0x10_0000,
                size: 0x400_0000,
            }],
            affinity: AffinitySpace::new(2, 2),
            ..Default::default()
        }
    }

    #[test]
    fn test_platform_info_rom_is_generated() {
        let core = Core::new(Arc::new(MockKernel::new()), &boot_info());
        let module = core.rom_registry().lookup("platform_info").unwrap();
        let text = String::from_utf8(module.content()).unwrap();
        assert!(text.contains("width=\"2\" height=\"2\""));
        assert!(text.contains("<ram total="));
    }

    #[test]
    fn test_create_child_seeds_quota_from_root() {
        let core = Core::new(Arc::new(MockKernel::new()), &boot_info());
        let total = core.router().ram_account().limit().value;

        let child = core
            .create_child("init", RamQuota { value: 1 << 20 }, CapQuota { value: 100 })
            .unwrap();
        assert_eq!(child.ram_account().limit().value, 1 << 20);
        assert_eq!(
            core.router().ram_account().limit().value,
            total - (1 << 20)
        );

        // transfers terminate at core's root account
        assert!(Arc::ptr_eq(
            &child.ram_account().reference().unwrap(),
            core.router().ram_account()
        ));
    }

    #[test]
    fn test_child_beyond_root_quota_is_refused() {
        let core = Core::new(Arc::new(MockKernel::new()), &boot_info());
        assert_eq!(
            core.create_child("greedy", RamQuota { value: 1 << 40 }, CapQuota { value: 1 })
                .unwrap_err(),
            SessionError::OutOfRam
        );
    }
}
