//! Local chapter discovery: a manga directory holds one directory per
//! chapter, each holding that chapter's page images.

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::page_loader::Page;
use crate::error::Result;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp"];

/// Chapter directory names under `manga_dir`, naturally sorted.
/// A missing directory has no chapters.
pub fn list_chapters(manga_dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = read_dir_or_empty(manga_dir)?
        .into_iter()
        .filter(|path| path.is_dir())
        .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    names.sort_by(|a, b| natural_cmp(a, b));
    Ok(names)
}

/// Image files directly inside `chapter_dir`, naturally sorted by name.
pub fn list_pages(chapter_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut pages: Vec<PathBuf> = read_dir_or_empty(chapter_dir)?
        .into_iter()
        .filter(|path| path.is_file() && is_image(path))
        .collect();
    pages.sort_by(|a, b| natural_cmp(&file_name(a), &file_name(b)));
    Ok(pages)
}

/// Pages of a local chapter, identified by the chapter directory's path.
pub fn local_pages(chapter_dir: &Path) -> Result<Vec<Page>> {
    let chapter_id = chapter_dir.to_string_lossy();
    Ok(list_pages(chapter_dir)?
        .into_iter()
        .enumerate()
        .map(|(index, path)| Page::local(&chapter_id, index, path))
        .collect())
}

fn read_dir_or_empty(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Case-insensitive comparison that orders digit runs by value,
/// so "Chapter 2" sorts before "Chapter 10".
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (a_lower, b_lower) = (a.to_lowercase(), b.to_lowercase());
    let mut left = a_lower.chars().peekable();
    let mut right = b_lower.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let x_run = take_digits(&mut left);
                let y_run = take_digits(&mut right);
                let x_trimmed = x_run.trim_start_matches('0');
                let y_trimmed = y_run.trim_start_matches('0');
                let ordering = x_trimmed
                    .len()
                    .cmp(&y_trimmed.len())
                    .then_with(|| x_trimmed.cmp(y_trimmed));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(c) = chars.next_if(|c| c.is_ascii_digit()) {
        run.push(c);
    }
    run
}
