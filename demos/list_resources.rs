fn main() {
    env_logger::init();

    let resources = match rusbtmc::list_resources() {
        Ok(resources) => resources,
        Err(e) => {
            eprintln!("failed to scan USB devices: {}", e);
            return;
        }
    };

    if resources.is_empty() {
        println!("no instruments found");
    }
    for resource in &resources {
        println!("{}", resource);
    }

    // query the identification of the instrument given on the command line
    if let Some(resource) = std::env::args().nth(1) {
        let mut instr = match rusbtmc::open_resource(&resource, b'\n') {
            Ok(instr) => instr,
            Err(e) => {
                eprintln!("failed to open {}: {}", resource, e);
                return;
            }
        };

        match instr.query("*IDN?\n") {
            Ok(idn) => println!("{}", idn.trim_end()),
            Err(e) => eprintln!("*IDN? failed: {}", e),
        }
    }
}
