//! Project scaffold and workspace instructions seeded into new sandboxes.
//!
//! The scaffold is a minimal Vite + React 19 project whose `src/App.tsx` is a
//! placeholder. `CLAUDE.md` tells the coding CLI what to produce: exactly
//! `src/App.tsx` and `src/data.ts`, inline-styled, no extra packages.

use super::SandboxFile;

const PACKAGE_JSON: &str = r#"{
  "name": "agent-widget",
  "private": true,
  "type": "module",
  "scripts": {
    "dev": "vite"
  },
  "dependencies": {
    "react": "^19.0.0",
    "react-dom": "^19.0.0"
  },
  "devDependencies": {
    "@vitejs/plugin-react": "^4.5.2",
    "vite": "^6.3.5"
  }
}
"#;

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1.0" />
    <title>Agent Widget</title>
    <style>
      *, *::before, *::after { box-sizing: border-box; margin: 0; padding: 0; }
      body {
        font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif;
        background: #0d1117;
        color: #e6edf3;
        min-height: 100vh;
      }
      #root { min-height: 100vh; }
    </style>
  </head>
  <body>
    <div id="root"></div>
    <script type="module" src="/src/main.tsx"></script>
  </body>
</html>
"#;

const MAIN_TSX: &str = r#"import { createRoot } from "react-dom/client";
import App from "./App";

createRoot(document.getElementById("root")!).render(<App />);
"#;

const PLACEHOLDER_APP: &str = r##"export default function App() {
  return (
    <div style={{ padding: 24, textAlign: "center", color: "#8b949e" }}>
      Loading...
    </div>
  );
}
"##;

const TSCONFIG: &str = r#"{
  "compilerOptions": {
    "target": "ES2020",
    "useDefineForClassFields": true,
    "lib": ["ES2020", "DOM", "DOM.Iterable"],
    "module": "ESNext",
    "skipLibCheck": true,
    "moduleResolution": "bundler",
    "allowImportingTsExtensions": true,
    "isolatedModules": true,
    "noEmit": true,
    "jsx": "react-jsx",
    "strict": true
  },
  "include": ["src"]
}
"#;

fn vite_config(port: u16) -> String {
    format!(
        r#"import {{ defineConfig }} from "vite";
import react from "@vitejs/plugin-react";

export default defineConfig({{
  plugins: [react()],
  server: {{
    host: "0.0.0.0",
    port: {port},
  }},
}});
"#
    )
}

fn instructions(project_dir: &str) -> String {
    format!(
        r#"# CLAUDE.md

## Role
You are a **frontend developer** building a Vite+React dashboard widget inside this workspace.
The project scaffold is already set up at `{project_dir}` with React 19 and Vite.

---

## Non-Negotiable Output Requirement (Highest Priority)

**You MUST write files directly to the filesystem, always.**
The task is NOT complete unless files are written.

---

## What to Generate

You must create/overwrite exactly two files:

1. **`src/App.tsx`**: the main React component
   - Dashboard widget matching the user's request
   - Use inline styles only (no CSS imports, no Tailwind)
   - Dark theme colors:
     - Background: #0d1117
     - Card background: #161b22
     - Border: #30363d
     - Text primary: #e6edf3
     - Text secondary: #8b949e
     - Accent/highlight: #7c3aed (purple)
     - Success: #3fb950
     - Warning: #d29922
     - Danger: #f85149
   - Include a header with title and description
   - Display data in a table or card grid layout
   - Must fill container width with reasonable height

2. **`src/data.ts`**: data module
   - Export a default array of realistic mock data objects
   - Export an async `fetchData()` function returning the array
   - Data should be relevant to the user's request

## Rules

- Do NOT install additional packages: only `react` and `react-dom` are available
- Do NOT use Tailwind CSS or any CSS framework
- All components must be valid TSX
- Make the widget look polished: rounded corners (8px), subtle borders, padding (16-24px)
- The App component must import and display data from "./data"
"#
    )
}

/// The Vite + React project files, rooted at `project_dir`.
pub fn scaffold_files(project_dir: &str, port: u16) -> Vec<SandboxFile> {
    let dir = project_dir.trim_end_matches('/');
    vec![
        SandboxFile::new(format!("{dir}/package.json"), PACKAGE_JSON),
        SandboxFile::new(format!("{dir}/vite.config.ts"), vite_config(port)),
        SandboxFile::new(format!("{dir}/index.html"), INDEX_HTML),
        SandboxFile::new(format!("{dir}/src/main.tsx"), MAIN_TSX),
        SandboxFile::new(format!("{dir}/src/App.tsx"), PLACEHOLDER_APP),
        SandboxFile::new(format!("{dir}/tsconfig.json"), TSCONFIG),
    ]
}

/// The instruction document read by the coding CLI.
pub fn workspace_files(project_dir: &str) -> Vec<SandboxFile> {
    let dir = project_dir.trim_end_matches('/');
    vec![SandboxFile::new(
        format!("{dir}/CLAUDE.md"),
        instructions(dir),
    )]
}

/// Everything a fresh sandbox is seeded with, in upload order.
pub fn seed_files(project_dir: &str, port: u16) -> Vec<SandboxFile> {
    let mut files = scaffold_files(project_dir, port);
    files.extend(workspace_files(project_dir));
    files
}
