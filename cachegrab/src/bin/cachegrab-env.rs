use cachegrab::GrabEnv;

fn main() {
    let num_cores = GrabEnv::online_cores();
    let allowed = match GrabEnv::allowed_cores() {
        Ok(c) => format!("{:?}", c),
        Err(e) => format!("<{}>", e),
    };

    let isol = GrabEnv::sysfs_isolated();
    let nohz = GrabEnv::sysfs_nohz();
    let smt = match GrabEnv::sysfs_smt_enabled() {
        Ok(true) => "enabled [!!]".to_string(),
        Ok(false) => "disabled".to_string(),
        Err(std::io::ErrorKind::NotFound) => "<not reported>".to_string(),
        Err(e) => format!("<{:?}>", e),
    };
    let pmu = match GrabEnv::sysfs_armv8_pmu_present() {
        true => "present",
        false => "missing [!!]",
    };
    let user_access = match GrabEnv::procfs_perf_user_access() {
        Ok(true) => "enabled".to_string(),
        Ok(false) => "disabled [!!]".to_string(),
        Err(std::io::ErrorKind::NotFound) => "<not supported by this kernel> [!!]".to_string(),
        Err(std::io::ErrorKind::PermissionDenied) => "<read error; are you root?>".to_string(),
        Err(e) => format!("<{:?}>", e),
    };
    let paranoid = match GrabEnv::procfs_perf_paranoid() {
        Ok(x) => x.to_string(),
        Err(e) => format!("<{:?}>", e),
    };
    let pagemap = match cachegrab::util::pagemap::PageMap::resolve_paddr(
        &num_cores as *const usize as usize)
    {
        Ok(_) => "available",
        Err(_) => "no PFNs (L1D sets use virtual addresses) [!!]",
    };
    let execute = match cachegrab::arch::can_execute_routines() {
        true => "yes",
        false => "no (not an AArch64 host) [!!]",
    };

    println!("[*] 'cachegrab' environment summary:");
    println!("  {:<40}: {}", "online cores", num_cores);
    println!("  {:<40}: {}", "allowed cores", allowed);
    println!("  {:<40}: {}", "isolated cores", isol);
    println!("  {:<40}: {}", "nohz_full cores", nohz);
    println!("  {:<40}: {}", "simultaneous multithreading (SMT)", smt);
    println!("  {:<40}: {}", "armv8 PMU", pmu);
    println!("  {:<40}: {}", "kernel.perf_user_access", user_access);
    println!("  {:<40}: {}", "kernel.perf_event_paranoid", paranoid);
    println!("  {:<40}: {}", "pagemap", pagemap);
    println!("  {:<40}: {}", "generated code runs", execute);
}
