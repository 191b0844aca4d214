/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

// Not every test binary exercises every helper here.
#![allow(dead_code)]

use bitstore::common::BufferFrameIdT;
use bitstore::relation::RecordFormat;

/// Constants used for testing
pub const TEST_BUFFER_SIZE: BufferFrameIdT = 4;

/// Install a logger for test runs. Repeated calls are harmless.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Build an owned attribute list from string pairs.
pub fn attributes(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// The demo record layout used by the integration tests: a 32-byte record
/// of name[20], age, gender, and department, with the numeric fields stored
/// as little-endian i32.
///
/// Null sentinels: an all-zero name, age -1, and 0 for the enum fields.
/// Ages are presented zero-padded to width 3 so the index's lexicographic
/// order matches numeric order.
pub struct StudentFormat;

pub const STUDENT_RECORD_SIZE: usize = 32;

const NAME_OFFSET: usize = 0;
const NAME_LEN: usize = 20;
const AGE_OFFSET: usize = 20;
const GENDER_OFFSET: usize = 24;
const DEPARTMENT_OFFSET: usize = 28;

const GENDERS: [&str; 2] = ["male", "female"];
const DEPARTMENTS: [&str; 4] = ["ComputerScience", "Physics", "Chemistry", "ForeignLanguage"];

impl RecordFormat for StudentFormat {
    fn record_size(&self) -> usize {
        STUDENT_RECORD_SIZE
    }

    fn init_record(&self, slot: &mut [u8]) {
        for byte in slot.iter_mut() {
            *byte = 0;
        }
        write_i32(slot, AGE_OFFSET, -1);
    }

    fn write_value(&self, slot: &mut [u8], name: &str, value: &str) {
        match name {
            "name" => {
                for byte in slot[NAME_OFFSET..NAME_OFFSET + NAME_LEN].iter_mut() {
                    *byte = 0;
                }
                let bytes = value.as_bytes();
                let len = bytes.len().min(NAME_LEN);
                slot[NAME_OFFSET..NAME_OFFSET + len].copy_from_slice(&bytes[..len]);
            }
            "age" => write_i32(slot, AGE_OFFSET, value.parse().unwrap_or(-1)),
            "gender" => write_i32(slot, GENDER_OFFSET, enum_code(&GENDERS, value)),
            "department" => write_i32(slot, DEPARTMENT_OFFSET, enum_code(&DEPARTMENTS, value)),
            // Attributes outside the layout are indexed but not stored.
            _ => {}
        }
    }
}

fn enum_code(variants: &[&str], value: &str) -> i32 {
    match variants.iter().position(|variant| *variant == value) {
        Some(idx) => idx as i32 + 1,
        None => 0,
    }
}

fn write_i32(slot: &mut [u8], offset: usize, value: i32) {
    slot[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_i32(data: &[u8], offset: usize) -> i32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    i32::from_le_bytes(bytes)
}

/// Decoders for asserting on record blobs.

pub fn student_name(data: &[u8]) -> String {
    let field = &data[NAME_OFFSET..NAME_OFFSET + NAME_LEN];
    let end = field.iter().position(|byte| *byte == 0).unwrap_or(NAME_LEN);
    String::from_utf8(field[..end].to_vec()).unwrap()
}

pub fn student_age(data: &[u8]) -> i32 {
    read_i32(data, AGE_OFFSET)
}

pub fn student_gender(data: &[u8]) -> &'static str {
    match read_i32(data, GENDER_OFFSET) {
        0 => "",
        code => GENDERS[code as usize - 1],
    }
}

pub fn student_department(data: &[u8]) -> &'static str {
    match read_i32(data, DEPARTMENT_OFFSET) {
        0 => "",
        code => DEPARTMENTS[code as usize - 1],
    }
}
