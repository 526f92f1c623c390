use vecadd::{
    anyhow::Result,
    buffer::Buffer,
    device::Device,
    host, kernel, verify,
    vector::N,
};

fn main() -> Result<()> {
    env_logger::init();
    let (a_host, b_host) = host::init_inputs(N)?;

    let device = Device::builder().profiling(true).build()?;
    if let Some(info) = device.info() {
        println!("Device used: {}", info.name());
    }

    let a = Buffer::upload(device.clone(), &a_host)?;
    let b = Buffer::upload(device.clone(), &b_host)?;
    let mut c = Buffer::zeros(device, N)?;

    let event = kernel::vector_add(&a, &b, &mut c)?;
    event.wait()?;
    let sample = event.profiling()?.sample();
    println!("Kernel time (device): {sample} seconds");

    let c = c.into_vec()?;
    let verification = verify::verify(&a_host, &b_host, &c)?;
    if let Some(mismatch) = verification.first_mismatch() {
        println!("{mismatch}");
    }
    println!("{verification}");
    Ok(())
}
