use vecadd::{anyhow::Result, host, vector::N};

fn main() -> Result<()> {
    env_logger::init();
    let (a, b) = host::init_inputs(N)?;
    let mut c = host::zeros(N)?;
    let sample = host::vector_add_timed(&a, &b, &mut c)?;
    println!("CPU time (parallel for): {sample} seconds");
    Ok(())
}
