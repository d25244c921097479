//! @文件引用 提取
//!
//! 在进入流程前把查询里的 `@filename.ext` 取出来：返回清理后的查询与引用文件列表，
//! 文件列表作为研究阶段的必选检索上下文。

use regex::Regex;

/// 提取 `@xxx.ext` 引用；返回 (清理后的查询, 文件列表)。
/// 引用顺序保持原样，重复引用去重。
pub fn extract_file_references(query: &str) -> (String, Vec<String>) {
    let re = Regex::new(r"@([\w\-.]+\.[A-Za-z0-9]+)").expect("file reference regex");

    let mut files: Vec<String> = Vec::new();
    for cap in re.captures_iter(query) {
        let name = cap[1].to_string();
        if !files.contains(&name) {
            files.push(name);
        }
    }

    let cleaned = re.replace_all(query, "");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    (cleaned, files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_files_and_cleans_query() {
        let (cleaned, files) =
            extract_file_references("@lesson1.pdf @notes.txt explain the concept");
        assert_eq!(files, vec!["lesson1.pdf", "notes.txt"]);
        assert_eq!(cleaned, "explain the concept");
    }

    #[test]
    fn test_inline_reference() {
        let (cleaned, files) =
            extract_file_references("summarize @chapter-2.docx for grade 8");
        assert_eq!(files, vec!["chapter-2.docx"]);
        assert_eq!(cleaned, "summarize for grade 8");
    }

    #[test]
    fn test_no_references() {
        let (cleaned, files) = extract_file_references("what is photosynthesis");
        assert!(files.is_empty());
        assert_eq!(cleaned, "what is photosynthesis");
    }

    #[test]
    fn test_duplicate_references_deduped() {
        let (_, files) = extract_file_references("@a.pdf compare @a.pdf with @b.pdf");
        assert_eq!(files, vec!["a.pdf", "b.pdf"]);
    }
}
