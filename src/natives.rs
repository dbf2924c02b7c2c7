use super::value::Value;
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch.
pub fn clock(_args: &[Value]) -> Result<Value, String> {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => Ok(Value::Number(elapsed.as_secs_f64())),
        Err(err) => Err(format!("Clock went backwards: {}.", err)),
    }
}

/// Uniform number in [0, 1).
pub fn random(_args: &[Value]) -> Result<Value, String> {
    let mut rng = rand::thread_rng();
    Ok(Value::Number(rng.gen_range(0.0..1.0)))
}
