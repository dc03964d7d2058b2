use log::{info, warn};
use num_integer::lcm;
use std::fs::{self, OpenOptions};
use std::io::Write;

/// Least common multiple of a periodic task set's periods.
pub fn get_hyper_period(periods: &[i64]) -> i64 {
    let mut hyper_period = 1;
    for &period in periods {
        hyper_period = lcm(hyper_period, period);
    }
    hyper_period
}

pub fn create_yaml_file(folder_path: &str, file_name: &str) -> String {
    if fs::metadata(folder_path).is_err() {
        let _ = fs::create_dir_all(folder_path);
        info!("Created folder: {}", folder_path);
    }
    let file_path = format!("{}/{}.yaml", folder_path, file_name);
    if let Err(err) = fs::File::create(&file_path) {
        warn!("Failed to create file: {}", err);
    }
    file_path
}

pub fn append_info_to_yaml(file_path: &str, info: &str) {
    if let Ok(mut file) = OpenOptions::new()
        .write(true)
        .append(true)
        .create(true)
        .open(file_path)
    {
        if let Err(err) = file.write_all(info.as_bytes()) {
            eprintln!("Failed to write to file: {}", err);
        }
    } else {
        eprintln!("Failed to open file: {}", file_path);
    }
}
