/// Main entry point for the xhs-desktop shell
fn main() {
    // The library chains its own hook in front of this one to stop the backend
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panic: {:?}", panic_info);
        std::process::exit(1);
    }));

    let code = xhs_desktop_lib::run();
    std::process::exit(code);
}
